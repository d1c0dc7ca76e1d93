//! Change feed processor host
//!
//! [`ChangeFeedProcessorBuilder`] wires the store, the feed and the
//! observer into the lease machinery of one host:
//!
//! ```rust,ignore
//! let processor = ChangeFeedProcessorBuilder::new()
//!     .store(store)
//!     .partition_source(feed.clone())
//!     .feed_reader(feed)
//!     .observer_factory(|| Arc::new(Projection::default()) as Arc<dyn ChangeFeedObserver>)
//!     .config(ProcessorConfig::from_file("processor.yaml")?)
//!     .build()?;
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await;
//! ```

use crate::balancer::{EqualPartitionsBalancingStrategy, LoadBalancingStrategy, PartitionLoadBalancer};
use crate::bootstrap::Bootstrapper;
use crate::config::ProcessorConfig;
use crate::controller::PartitionController;
use crate::error::{LeaseError, LeaseResult};
use crate::feed::ChangeFeedReader;
use crate::health::{HealthMonitor, TracingHealthMonitor};
use crate::lease_manager::{DocumentLeaseManager, LeaseManager};
use crate::lease_store::LeaseStore;
use crate::manager::PartitionManager;
use crate::observer::ObserverFactory;
use crate::store::{DocumentStore, PartitionSource};
use crate::supervisor::{DefaultSupervisorFactory, SupervisorSettings};
use crate::synchronizer::PartitionSynchronizer;
use crate::types::{HostId, LeaseToken};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessorState {
    Created,
    Running,
    Stopped,
}

/// One host of a change feed consumer group
pub struct ChangeFeedProcessor {
    host: HostId,
    partitions: PartitionManager,
    lease_manager: Arc<dyn LeaseManager>,
    state: Mutex<ProcessorState>,
}

impl std::fmt::Debug for ChangeFeedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedProcessor")
            .field("host", &self.host)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ChangeFeedProcessor {
    pub fn builder() -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessorBuilder::new()
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Lease manager of this host, e.g. to inspect the lease set
    pub fn lease_manager(&self) -> &Arc<dyn LeaseManager> {
        &self.lease_manager
    }

    /// Partitions currently processed by this host
    pub fn owned_partitions(&self) -> Vec<LeaseToken> {
        self.partitions.controller().owned_partitions()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == ProcessorState::Running
    }

    /// Bootstrap the group if needed and begin acquiring partitions.
    ///
    /// A processor can be started once.
    pub async fn start(&self) -> LeaseResult<()> {
        {
            let mut state = self.state.lock();
            if *state != ProcessorState::Created {
                return Err(LeaseError::config("processor was already started"));
            }
            *state = ProcessorState::Running;
        }

        if let Err(e) = self.partitions.start().await {
            *self.state.lock() = ProcessorState::Stopped;
            return Err(e);
        }
        info!(host = %self.host, "Change feed processor started");
        Ok(())
    }

    /// Stop every partition and release its lease
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::Stopped;
        }
        self.partitions.stop().await;
        info!(host = %self.host, "Change feed processor stopped");
    }
}

/// Builder for [`ChangeFeedProcessor`]
#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    partition_source: Option<Arc<dyn PartitionSource>>,
    feed_reader: Option<Arc<dyn ChangeFeedReader>>,
    observer_factory: Option<Arc<dyn ObserverFactory>>,
    health: Option<Arc<dyn HealthMonitor>>,
    strategy: Option<Arc<dyn LoadBalancingStrategy>>,
    config: ProcessorConfig,
}

impl ChangeFeedProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the lease documents
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Source of the partition set of the monitored feed
    pub fn partition_source(mut self, source: Arc<dyn PartitionSource>) -> Self {
        self.partition_source = Some(source);
        self
    }

    pub fn feed_reader(mut self, reader: Arc<dyn ChangeFeedReader>) -> Self {
        self.feed_reader = Some(reader);
        self
    }

    pub fn observer_factory(mut self, factory: impl ObserverFactory + 'static) -> Self {
        self.observer_factory = Some(Arc::new(factory));
        self
    }

    /// Health sink; defaults to [`TracingHealthMonitor`]
    pub fn health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Balancing strategy; defaults to [`EqualPartitionsBalancingStrategy`]
    pub fn load_balancing_strategy(mut self, strategy: Arc<dyn LoadBalancingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.config.host_name = host_name.into();
        self
    }

    pub fn lease_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.lease_prefix = prefix.into();
        self
    }

    /// Validate the configuration and wire the processor
    pub fn build(self) -> LeaseResult<ChangeFeedProcessor> {
        let store = self
            .store
            .ok_or_else(|| LeaseError::config("a lease store is required"))?;
        let source = self
            .partition_source
            .ok_or_else(|| LeaseError::config("a partition source is required"))?;
        let reader = self
            .feed_reader
            .ok_or_else(|| LeaseError::config("a feed reader is required"))?;
        let observers = self
            .observer_factory
            .ok_or_else(|| LeaseError::config("an observer factory is required"))?;
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(TracingHealthMonitor));

        let config = self.config;
        config.validate()?;
        let host = config.host_id();
        let prefix = config.lease_prefix.clone();

        let manager: Arc<dyn LeaseManager> = Arc::new(DocumentLeaseManager::new(
            store.clone(),
            prefix.clone(),
            host.clone(),
            config.max_update_attempts,
        ));

        let factory = DefaultSupervisorFactory::new(
            manager.clone(),
            reader,
            observers,
            health.clone(),
            SupervisorSettings {
                renew_interval: config.lease_renew_interval(),
                poll_delay: config.feed_poll_delay(),
                read_options: config.feed_read_options(),
                checkpoint: config.checkpoint.clone(),
                start_continuation: config.start_continuation.clone(),
            },
        )?;

        let synchronizer = Arc::new(PartitionSynchronizer::new(source, manager.clone()));
        let controller = PartitionController::new(
            manager.clone(),
            Arc::new(factory),
            synchronizer.clone(),
            health.clone(),
        );

        let strategy = self.strategy.unwrap_or_else(|| {
            Arc::new(
                EqualPartitionsBalancingStrategy::new(host.clone(), config.lease_expiration_interval())
                    .with_partition_bounds(config.min_partition_count, config.max_partition_count)
                    .with_surplus_release(config.release_surplus_leases),
            )
        });
        let balancer = PartitionLoadBalancer::new(
            controller.clone(),
            manager.clone(),
            strategy,
            health.clone(),
            config.lease_acquire_interval(),
        );

        let bootstrapper = Bootstrapper::new(
            Arc::new(LeaseStore::new(store, prefix, host.clone())),
            synchronizer,
            config.bootstrap_lock_ttl(),
            config.bootstrap_retry_delay(),
        );

        Ok(ChangeFeedProcessor {
            host,
            partitions: PartitionManager::new(bootstrapper, controller, balancer, health),
            lease_manager: manager,
            state: Mutex::new(ProcessorState::Created),
        })
    }
}
