//! Per-partition supervision
//!
//! A [`PartitionSupervisor`] owns everything needed to consume one leased
//! partition: the decorated observer, the feed processing loop and the
//! lease renewer. Both loops run concurrently; whichever ends first stops
//! the other.
//!
//! ```text
//! Starting ──► Running ──► Stopping ──► Stopped
//!                 │
//!                 └──────► Faulted   (lease lost, partition gone, observer error)
//! ```

use crate::checkpointer::{LeaseCheckpointer, PartitionCheckpointer, SharedLease};
use crate::config::CheckpointFrequency;
use crate::error::{LeaseError, LeaseResult};
use crate::feed::{ChangeFeedReader, FeedReadOptions, PartitionProcessor};
use crate::health::{HealthMonitor, HealthMonitoringRecord, MonitoredOperation};
use crate::lease::Lease;
use crate::lease_manager::LeaseManager;
use crate::observer::{
    checkpointing, decorate, error_reporting, ChangeFeedObserver, CloseReason, ObserverContext,
    ObserverFactory,
};
use crate::renewer::LeaseRenewer;
use crate::types::LeaseToken;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a partition supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Close reason for the error that ended a partition session
pub fn close_reason(err: &LeaseError) -> CloseReason {
    match err {
        LeaseError::LeaseLost { .. } => CloseReason::LeaseLost,
        LeaseError::PartitionGone { .. } => CloseReason::ResourceGone,
        LeaseError::Observer { .. } => CloseReason::ObserverError,
        LeaseError::StoreUnavailable(_) => CloseReason::ReadSessionNotAvailable,
        LeaseError::Shutdown => CloseReason::Shutdown,
        _ => CloseReason::Unknown,
    }
}

/// Drives the processing of one leased partition
pub struct PartitionSupervisor {
    lease: SharedLease,
    observer: Arc<dyn ChangeFeedObserver>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
    processor: PartitionProcessor,
    renewer: LeaseRenewer,
    health: Arc<dyn HealthMonitor>,
    state: RwLock<SupervisorState>,
}

impl PartitionSupervisor {
    pub fn new(
        lease: SharedLease,
        observer: Arc<dyn ChangeFeedObserver>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        processor: PartitionProcessor,
        renewer: LeaseRenewer,
        health: Arc<dyn HealthMonitor>,
    ) -> Self {
        Self {
            lease,
            observer,
            checkpointer,
            processor,
            renewer,
            health,
            state: RwLock::new(SupervisorState::Starting),
        }
    }

    pub fn lease_token(&self) -> &LeaseToken {
        self.lease.lease_token()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    /// Latest known state of the supervised lease
    pub async fn lease(&self) -> Lease {
        self.lease.snapshot().await
    }

    fn transition(&self, next: SupervisorState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        debug!(lease_token = %self.lease.lease_token(), from = %previous, to = %next, "Supervisor state change");
    }

    fn context(&self) -> ObserverContext {
        ObserverContext::new(
            self.lease.lease_token().clone(),
            self.processor.continuation().map(str::to_string),
            self.checkpointer.clone(),
        )
    }

    /// Process the partition until `cancel` fires or the session ends.
    ///
    /// Returns `Ok(())` after a requested stop. Any error is the reason the
    /// session faulted; the observer has been closed in both cases.
    pub async fn run(&mut self, cancel: CancellationToken) -> LeaseResult<()> {
        let lease_token = self.lease.lease_token().clone();

        if let Err(e) = self.observer.open(&self.context()).await {
            warn!(lease_token = %lease_token, error = %e, "Observer failed to open");
            return self.fault(e, MonitoredOperation::ObserverOpen).await;
        }

        self.transition(SupervisorState::Running);
        info!(lease_token = %lease_token, "Partition processing started");

        let stop = cancel.child_token();
        let (processed, renewed) = {
            let processor = &mut self.processor;
            let renewer = &self.renewer;
            tokio::join!(
                async {
                    let result = processor.run(stop.clone()).await;
                    stop.cancel();
                    result
                },
                async {
                    let result = renewer.run(stop.clone()).await;
                    stop.cancel();
                    result
                },
            )
        };

        let outcome = match (processed, renewed) {
            (Err(e), _) => Err((
                e,
                self.processor
                    .failed_operation()
                    .unwrap_or(MonitoredOperation::ReadFeed),
            )),
            (Ok(()), Err(e)) => Err((e, MonitoredOperation::RenewLease)),
            (Ok(()), Ok(())) => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.transition(SupervisorState::Stopping);
                self.observer
                    .close(&self.context(), CloseReason::Shutdown)
                    .await;
                self.transition(SupervisorState::Stopped);
                info!(lease_token = %lease_token, "Partition processing stopped");
                Ok(())
            }
            Err((e, operation)) => self.fault(e, operation).await,
        }
    }

    async fn fault(&mut self, err: LeaseError, operation: MonitoredOperation) -> LeaseResult<()> {
        let lease_token = self.lease.lease_token().clone();
        let reason = match (operation, &err) {
            // the feed itself was fine
            (MonitoredOperation::Checkpoint, LeaseError::StoreUnavailable(_)) => {
                CloseReason::Unknown
            }
            _ => close_reason(&err),
        };

        self.observer.close(&self.context(), reason).await;
        self.transition(SupervisorState::Faulted);

        self.health
            .inspect(HealthMonitoringRecord::error(
                operation,
                Some(&lease_token),
                &err,
            ))
            .await;

        warn!(lease_token = %lease_token, %reason, error = %err, "Partition processing faulted");
        Err(err)
    }
}

/// Builds the supervisor for a freshly acquired lease
pub trait PartitionSupervisorFactory: Send + Sync {
    fn create(&self, lease: Lease) -> LeaseResult<PartitionSupervisor>;
}

/// Settings shared by every supervisor of a processor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub renew_interval: Duration,
    pub poll_delay: Duration,
    pub read_options: FeedReadOptions,
    pub checkpoint: CheckpointFrequency,
    /// Starting position for leases without a checkpoint
    pub start_continuation: Option<String>,
}

/// Supervisor factory wiring the standard observer decorators
pub struct DefaultSupervisorFactory {
    manager: Arc<dyn LeaseManager>,
    reader: Arc<dyn ChangeFeedReader>,
    observers: Arc<dyn ObserverFactory>,
    health: Arc<dyn HealthMonitor>,
    settings: SupervisorSettings,
}

impl DefaultSupervisorFactory {
    pub fn new(
        manager: Arc<dyn LeaseManager>,
        reader: Arc<dyn ChangeFeedReader>,
        observers: Arc<dyn ObserverFactory>,
        health: Arc<dyn HealthMonitor>,
        settings: SupervisorSettings,
    ) -> LeaseResult<Self> {
        settings.checkpoint.validate()?;
        if settings.renew_interval.is_zero() {
            return Err(LeaseError::config("renew interval must be greater than zero"));
        }
        Ok(Self {
            manager,
            reader,
            observers,
            health,
            settings,
        })
    }
}

impl PartitionSupervisorFactory for DefaultSupervisorFactory {
    fn create(&self, lease: Lease) -> LeaseResult<PartitionSupervisor> {
        let lease_token = lease.lease_token.clone();
        let start = lease
            .continuation_token
            .clone()
            .or_else(|| self.settings.start_continuation.clone());

        let shared = SharedLease::new(lease);
        let checkpointer: Arc<dyn PartitionCheckpointer> =
            Arc::new(LeaseCheckpointer::new(shared.clone(), self.manager.clone()));

        let observer = decorate(
            self.observers.create_observer(),
            &[
                error_reporting(self.health.clone()),
                checkpointing(self.settings.checkpoint.clone()),
            ],
        );

        let processor = PartitionProcessor::new(
            lease_token,
            self.reader.clone(),
            observer.clone(),
            checkpointer.clone(),
            self.settings.read_options,
            self.settings.poll_delay,
            start,
        );
        let renewer = LeaseRenewer::new(
            shared.clone(),
            self.manager.clone(),
            self.settings.renew_interval,
        );

        Ok(PartitionSupervisor::new(
            shared,
            observer,
            checkpointer,
            processor,
            renewer,
            self.health.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeRecord;
    use crate::health::RecordingHealthMonitor;
    use crate::lease_manager::DocumentLeaseManager;
    use crate::error::StoreError;
    use crate::store::{InMemoryChangeFeed, InMemoryDocumentStore, StoreOperation};
    use crate::types::HostId;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChangeRecord>>,
        closed: Mutex<Vec<CloseReason>>,
        fail_on: Option<ChangeRecord>,
    }

    #[async_trait]
    impl ChangeFeedObserver for Recorder {
        async fn close(&self, _context: &ObserverContext, reason: CloseReason) {
            self.closed.lock().push(reason);
        }

        async fn process_changes(
            &self,
            context: &ObserverContext,
            changes: Vec<ChangeRecord>,
        ) -> LeaseResult<()> {
            if let Some(poison) = &self.fail_on {
                if changes.contains(poison) {
                    return Err(LeaseError::observer(context.lease_token(), "poison record"));
                }
            }
            self.seen.lock().extend(changes);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        feed: Arc<InMemoryChangeFeed>,
        manager: Arc<DocumentLeaseManager>,
        recorder: Arc<Recorder>,
        health: Arc<RecordingHealthMonitor>,
    }

    impl Fixture {
        fn new(recorder: Recorder) -> Self {
            let store = Arc::new(InMemoryDocumentStore::new());
            Self {
                manager: Arc::new(DocumentLeaseManager::new(
                    store.clone(),
                    "group",
                    HostId::new("a"),
                    5,
                )),
                store,
                feed: Arc::new(InMemoryChangeFeed::with_partitions(["0"])),
                recorder: Arc::new(recorder),
                health: Arc::new(RecordingHealthMonitor::new()),
            }
        }

        fn factory(&self) -> DefaultSupervisorFactory {
            let recorder = self.recorder.clone();
            DefaultSupervisorFactory::new(
                self.manager.clone(),
                self.feed.clone(),
                Arc::new(move || recorder.clone() as Arc<dyn ChangeFeedObserver>),
                self.health.clone(),
                SupervisorSettings {
                    renew_interval: Duration::from_secs(5),
                    poll_delay: Duration::from_millis(100),
                    read_options: FeedReadOptions::default(),
                    checkpoint: CheckpointFrequency::every_batch(),
                    start_continuation: None,
                },
            )
            .unwrap()
        }

        async fn held_lease(&self) -> Lease {
            let lease = self
                .manager
                .create_lease_if_not_exists(&LeaseToken::new("0"), None)
                .await
                .unwrap()
                .unwrap();
            self.manager.acquire(lease).await.unwrap()
        }

        async fn stored_lease(&self) -> Lease {
            self.manager.list_all_leases().await.unwrap().remove(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_checkpoints_and_stops() {
        let fixture = Fixture::new(Recorder::default());
        for i in 0..3 {
            fixture.feed.append("0", json!(i));
        }
        let mut supervisor = fixture.factory().create(fixture.held_lease().await).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Starting);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        supervisor.run(cancel).await.unwrap();

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(fixture.recorder.seen.lock().len(), 3);
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::Shutdown]);
        assert_eq!(
            fixture.stored_lease().await.continuation_token.as_deref(),
            Some("3")
        );
        assert!(fixture.health.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_stolen_faults_supervisor() {
        let fixture = Fixture::new(Recorder::default());
        let held = fixture.held_lease().await;
        let mut supervisor = fixture.factory().create(held).unwrap();

        let thief = DocumentLeaseManager::new(fixture.store.clone(), "group", HostId::new("b"), 5);
        let cancel = CancellationToken::new();

        let run = tokio::spawn(async move {
            let result = supervisor.run(cancel).await;
            (result, supervisor.state())
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        // read after the first renewal so the steal does not race it
        let store_view = fixture.stored_lease().await;
        thief.acquire(store_view).await.unwrap();
        let thief_view = fixture.stored_lease().await;
        assert_eq!(thief_view.owner, Some(HostId::new("b")));

        let (result, state) = run.await.unwrap();
        assert!(result.unwrap_err().is_lease_lost());
        assert_eq!(state, SupervisorState::Faulted);
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::LeaseLost]);
        let errors = fixture.health.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].operation, MonitoredOperation::RenewLease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_checkpoint_is_reported_as_checkpoint() {
        let fixture = Fixture::new(Recorder::default());
        fixture.feed.append("0", json!(1));
        let mut supervisor = fixture.factory().create(fixture.held_lease().await).unwrap();
        // one for the first renewal, one for the checkpoint after the batch
        for _ in 0..2 {
            fixture.store.inject_fault(
                StoreOperation::Replace,
                StoreError::Unavailable("throttled".into()),
            );
        }

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, LeaseError::StoreUnavailable(_)));
        assert_eq!(supervisor.state(), SupervisorState::Faulted);
        assert_eq!(fixture.recorder.seen.lock().len(), 1);
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::Unknown]);
        let operations: Vec<_> = fixture
            .health
            .errors()
            .into_iter()
            .map(|record| record.operation)
            .collect();
        assert_eq!(operations, vec![MonitoredOperation::Checkpoint]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_after_steal_is_reported_as_checkpoint() {
        let fixture = Fixture::new(Recorder::default());
        let mut supervisor = fixture.factory().create(fixture.held_lease().await).unwrap();
        let thief = DocumentLeaseManager::new(fixture.store.clone(), "group", HostId::new("b"), 5);

        let feed = fixture.feed.clone();
        let run = tokio::spawn(async move {
            let result = supervisor.run(CancellationToken::new()).await;
            (result, supervisor)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        thief.acquire(fixture.stored_lease().await).await.unwrap();
        feed.append("0", json!(1));

        let (result, _supervisor) = run.await.unwrap();
        assert!(result.unwrap_err().is_lease_lost());
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::LeaseLost]);
        let errors = fixture.health.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].operation, MonitoredOperation::Checkpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_error_faults_supervisor() {
        let fixture = Fixture::new(Recorder {
            fail_on: Some(json!("poison")),
            ..Default::default()
        });
        fixture.feed.append("0", json!("poison"));
        let mut supervisor = fixture.factory().create(fixture.held_lease().await).unwrap();

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, LeaseError::Observer { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Faulted);
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::ObserverError]);
        // reported by the error-reporting decorator and by the supervisor
        let errors = fixture.health.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].operation, MonitoredOperation::ObserverProcess);
        assert!(fixture.stored_lease().await.continuation_token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_gone_closes_with_resource_gone() {
        let fixture = Fixture::new(Recorder::default());
        let mut supervisor = fixture.factory().create(fixture.held_lease().await).unwrap();
        fixture.feed.split("0", ["1", "2"]);

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LeaseError::PartitionGone { .. }));
        assert_eq!(fixture.recorder.closed.lock().clone(), vec![CloseReason::ResourceGone]);
    }

    #[test]
    fn test_invalid_checkpoint_frequency_is_rejected() {
        let fixture = Fixture::new(Recorder::default());
        let recorder = fixture.recorder.clone();
        let result = DefaultSupervisorFactory::new(
            fixture.manager.clone(),
            fixture.feed.clone(),
            Arc::new(move || recorder.clone() as Arc<dyn ChangeFeedObserver>),
            fixture.health.clone(),
            SupervisorSettings {
                renew_interval: Duration::from_secs(5),
                poll_delay: Duration::from_millis(100),
                read_options: FeedReadOptions::default(),
                checkpoint: CheckpointFrequency {
                    time_interval_ms: Some(0),
                    ..Default::default()
                },
                start_continuation: None,
            },
        );
        assert!(matches!(result, Err(LeaseError::InvalidArgument(_))));
    }

    #[test]
    fn test_close_reason_mapping() {
        let token = LeaseToken::new("0");
        assert_eq!(close_reason(&LeaseError::lease_lost(&token, "x")), CloseReason::LeaseLost);
        assert_eq!(
            close_reason(&LeaseError::PartitionGone { lease_token: token.clone() }),
            CloseReason::ResourceGone
        );
        assert_eq!(close_reason(&LeaseError::observer(&token, "x")), CloseReason::ObserverError);
        assert!(SupervisorState::Faulted.is_terminal());
        assert!(!SupervisorState::Running.is_terminal());
    }
}
