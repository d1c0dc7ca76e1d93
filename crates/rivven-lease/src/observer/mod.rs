//! Business-logic observers
//!
//! An observer receives the change batches of one partition. Processing
//! behaviour that is not business logic (automatic checkpointing, failure
//! reporting) is layered on as decorators: plain functions from observer to
//! observer, composed when a partition is started.
//!
//! ```text
//! feed loop ──► auto_checkpoint ──► error_reporting ──► business observer
//! ```

pub mod auto_checkpoint;
pub mod error_reporting;

use crate::checkpointer::PartitionCheckpointer;
use crate::error::LeaseResult;
use crate::feed::ChangeRecord;
use crate::types::LeaseToken;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use auto_checkpoint::{checkpointing, AutoCheckpointer};
pub use error_reporting::{error_reporting, ErrorReportingObserver};

/// Why an observer is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown,
    /// The host is shutting down or the lease was handed back
    Shutdown,
    /// Another host took the lease or it was deleted
    LeaseLost,
    /// The partition was split or retired
    ResourceGone,
    /// The observer itself failed
    ObserverError,
    /// The feed could not be read
    ReadSessionNotAvailable,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Unknown => "unknown",
            Self::Shutdown => "shutdown",
            Self::LeaseLost => "lease_lost",
            Self::ResourceGone => "resource_gone",
            Self::ObserverError => "observer_error",
            Self::ReadSessionNotAvailable => "read_session_not_available",
        };
        f.write_str(reason)
    }
}

/// Per-delivery context handed to observers
#[derive(Clone)]
pub struct ObserverContext {
    lease_token: LeaseToken,
    continuation: Option<String>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
}

impl ObserverContext {
    pub fn new(
        lease_token: LeaseToken,
        continuation: Option<String>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
    ) -> Self {
        Self {
            lease_token,
            continuation,
            checkpointer,
        }
    }

    /// Partition being processed
    pub fn lease_token(&self) -> &LeaseToken {
        &self.lease_token
    }

    /// Feed position just after the batch being delivered
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Durably record that everything up to this delivery is processed.
    ///
    /// Fails with a lease-lost error if the partition was taken over since
    /// the last successful write.
    pub async fn checkpoint(&self) -> LeaseResult<()> {
        match self.continuation.as_deref() {
            Some(continuation) => self.checkpointer.checkpoint_partition(continuation).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("lease_token", &self.lease_token)
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// Consumer of the changes of one partition
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    /// Called once before the first batch
    async fn open(&self, _context: &ObserverContext) -> LeaseResult<()> {
        Ok(())
    }

    /// Called once when processing of the partition ends
    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) {}

    /// Process one batch of changes, in feed order
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<ChangeRecord>,
    ) -> LeaseResult<()>;
}

/// Creates one observer per acquired partition
pub trait ObserverFactory: Send + Sync {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver>;
}

impl<F> ObserverFactory for F
where
    F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync,
{
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        self()
    }
}

/// A decorator wraps an observer in another observer
pub type ObserverDecorator =
    Arc<dyn Fn(Arc<dyn ChangeFeedObserver>) -> Arc<dyn ChangeFeedObserver> + Send + Sync>;

/// Apply `decorators` to `observer`, innermost first
pub fn decorate(
    observer: Arc<dyn ChangeFeedObserver>,
    decorators: &[ObserverDecorator],
) -> Arc<dyn ChangeFeedObserver> {
    decorators
        .iter()
        .fold(observer, |observer, decorator| decorator(observer))
}
