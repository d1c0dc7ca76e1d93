//! # Rivven Lease
//!
//! Partition leases and checkpointing for change-feed consumer groups:
//! - **Leases**: one document per partition, owned by at most one live host
//! - **Optimistic concurrency**: every lease write is a conditional replace
//! - **Checkpoints**: continuation tokens stored on the lease, on a cadence
//! - **Load balancing**: hosts spread partitions evenly without a coordinator
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ChangeFeedProcessor                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ PartitionManager: bootstrap → controller → load balancer     │
//! ├───────────────┬──────────────────────┬───────────────────────┤
//! │ Bootstrapper  │ PartitionController  │ PartitionLoadBalancer │
//! │ • info marker │ • one supervisor per │ • fair share target   │
//! │ • init lock   │   owned partition    │ • expired first       │
//! │               │ • split handling     │ • steal one per pass  │
//! ├───────────────┴──────────────────────┴───────────────────────┤
//! │ PartitionSupervisor: observer + feed loop + lease renewer    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ LeaseManager / LeaseUpdater (conditional replace, retries)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ DocumentStore (versioned documents)  │ PartitionSource       │
//! └──────────────────────────────────────┴───────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use rivven_lease::prelude::*;
//!
//! let feed = Arc::new(InMemoryChangeFeed::with_partitions(["0", "1", "2", "3"]));
//! let processor = ChangeFeedProcessor::builder()
//!     .store(Arc::new(InMemoryDocumentStore::new()))
//!     .partition_source(feed.clone())
//!     .feed_reader(feed)
//!     .observer_factory(|| Arc::new(MyObserver) as Arc<dyn ChangeFeedObserver>)
//!     .host_name("worker-1")
//!     .lease_prefix("orders")
//!     .build()?;
//!
//! processor.start().await?;
//! ```

pub mod balancer;
pub mod bootstrap;
pub mod checkpointer;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod health;
pub mod lease;
pub mod lease_manager;
pub mod lease_store;
pub mod manager;
pub mod observability;
pub mod observer;
pub mod processor;
pub mod renewer;
pub mod store;
pub mod supervisor;
pub mod synchronizer;
pub mod types;
pub mod updater;

// Re-export main types
pub use balancer::{EqualPartitionsBalancingStrategy, LoadBalancingStrategy, PartitionLoadBalancer};
pub use bootstrap::Bootstrapper;
pub use checkpointer::{LeaseCheckpointer, PartitionCheckpointer, SharedLease};
pub use config::{CheckpointFrequency, ProcessorConfig};
pub use controller::PartitionController;
pub use error::{LeaseError, LeaseResult, StoreError, StoreResult};
pub use feed::{ChangeFeedReader, ChangeRecord, FeedPage, FeedReadOptions, PartitionProcessor};
pub use health::{
    HealthMonitor, HealthMonitoringRecord, HealthSeverity, MonitoredOperation,
    RecordingHealthMonitor, TracingHealthMonitor,
};
pub use lease::Lease;
pub use lease_manager::{DocumentLeaseManager, LeaseManager};
pub use lease_store::LeaseStore;
pub use manager::PartitionManager;
pub use observability::LeaseMetrics;
pub use observer::{
    decorate, ChangeFeedObserver, CloseReason, ObserverContext, ObserverDecorator, ObserverFactory,
};
pub use processor::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use renewer::LeaseRenewer;
pub use store::{
    Document, DocumentStore, InMemoryChangeFeed, InMemoryDocumentStore, PartitionDescriptor,
    PartitionSource, StoreOperation, VersionedDocument,
};
pub use supervisor::{
    DefaultSupervisorFactory, PartitionSupervisor, PartitionSupervisorFactory, SupervisorSettings,
    SupervisorState,
};
pub use synchronizer::PartitionSynchronizer;
pub use types::{ConcurrencyToken, HostId, LeaseToken};
pub use updater::{LeaseUpdater, DEFAULT_MAX_UPDATE_ATTEMPTS};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::feed::{ChangeFeedReader, ChangeRecord, FeedPage, FeedReadOptions};
    pub use crate::observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory};
    pub use crate::processor::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
    pub use crate::store::{DocumentStore, InMemoryChangeFeed, InMemoryDocumentStore, PartitionSource};
    pub use crate::types::*;
    pub use std::sync::Arc;
}
