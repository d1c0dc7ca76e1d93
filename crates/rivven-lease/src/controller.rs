//! Partition controller
//!
//! Tracks the partitions this host is processing. Each owned partition runs
//! as its own task; when a task ends the controller settles the lease:
//!
//! | Outcome              | Lease action                                 |
//! |----------------------|----------------------------------------------|
//! | stopped / shutdown   | released                                     |
//! | lease lost           | none, another host owns it now               |
//! | partition gone       | replaced by child leases, then deleted       |
//! | any other failure    | released so any host can pick it up again    |

use crate::error::{LeaseError, LeaseResult};
use crate::health::{HealthMonitor, HealthMonitoringRecord, MonitoredOperation};
use crate::lease::Lease;
use crate::lease_manager::LeaseManager;
use crate::observability::LeaseMetrics;
use crate::supervisor::{PartitionSupervisor, PartitionSupervisorFactory};
use crate::synchronizer::PartitionSynchronizer;
use crate::types::{HostId, LeaseToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunningPartition {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts and stops partition supervisors on this host
pub struct PartitionController {
    manager: Arc<dyn LeaseManager>,
    factory: Arc<dyn PartitionSupervisorFactory>,
    synchronizer: Arc<PartitionSynchronizer>,
    health: Arc<dyn HealthMonitor>,
    running: Mutex<HashMap<LeaseToken, RunningPartition>>,
    shutdown: CancellationToken,
}

impl PartitionController {
    pub fn new(
        manager: Arc<dyn LeaseManager>,
        factory: Arc<dyn PartitionSupervisorFactory>,
        synchronizer: Arc<PartitionSynchronizer>,
        health: Arc<dyn HealthMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            factory,
            synchronizer,
            health,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn host(&self) -> &HostId {
        self.manager.host()
    }

    /// Partitions with a live supervisor on this host
    pub fn owned_partitions(&self) -> Vec<LeaseToken> {
        let mut tokens: Vec<LeaseToken> = self.running.lock().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn is_running(&self, lease_token: &LeaseToken) -> bool {
        self.running.lock().contains_key(lease_token)
    }

    /// Register new partitions and resume leases this host already owns.
    ///
    /// Leases recorded as owned by this host (from a previous run under the
    /// same host name) are resumed without a new acquisition; the renewer
    /// refreshes them immediately.
    pub async fn initialize(self: &Arc<Self>) -> LeaseResult<()> {
        self.synchronizer.create_missing_leases().await?;

        let owned = self.manager.list_owned_leases().await?;
        info!(host = %self.host(), resumed = owned.len(), "Partition controller initialized");
        for lease in owned {
            self.start(lease).await;
        }
        Ok(())
    }

    /// Acquire `lease` and start processing it.
    ///
    /// Does nothing if the partition is already processed here. Losing the
    /// acquisition race to another host surfaces as a lease-lost error.
    pub async fn add_or_update_lease(self: &Arc<Self>, lease: Lease) -> LeaseResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(LeaseError::Shutdown);
        }
        if self.is_running(&lease.lease_token) {
            debug!(lease_token = %lease.lease_token, "Partition already running");
            return Ok(());
        }

        let lease_token = lease.lease_token.clone();
        let acquired = match self.manager.acquire(lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                let record = if e.is_lease_lost() {
                    debug!(lease_token = %lease_token, error = %e, "Lease acquired by another host first");
                    HealthMonitoringRecord::informational(
                        MonitoredOperation::AcquireLease,
                        Some(&lease_token),
                    )
                } else {
                    warn!(lease_token = %lease_token, error = %e, "Failed to acquire lease");
                    HealthMonitoringRecord::error(
                        MonitoredOperation::AcquireLease,
                        Some(&lease_token),
                        &e,
                    )
                };
                self.health.inspect(record).await;
                return Err(e);
            }
        };

        self.start(acquired).await;
        Ok(())
    }

    /// Stop processing a partition and hand its lease back
    pub fn stop_partition(&self, lease_token: &LeaseToken) -> bool {
        match self.running.lock().get(lease_token) {
            Some(partition) => {
                partition.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn start(self: &Arc<Self>, lease: Lease) {
        let lease_token = lease.lease_token.clone();
        let supervisor = match self.factory.create(lease.clone()) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                warn!(lease_token = %lease_token, error = %e, "Failed to create partition supervisor");
                self.health
                    .inspect(HealthMonitoringRecord::error(
                        MonitoredOperation::AcquireLease,
                        Some(&lease_token),
                        &e,
                    ))
                    .await;
                self.release(lease).await;
                return;
            }
        };

        let mut running = self.running.lock();
        if running.contains_key(&lease_token) {
            return;
        }

        let cancel = self.shutdown.child_token();
        let controller = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            controller.supervise(supervisor, task_cancel).await;
        });
        running.insert(lease_token, RunningPartition { cancel, handle });
        LeaseMetrics::set_owned_partitions(running.len());
    }

    async fn supervise(self: Arc<Self>, mut supervisor: PartitionSupervisor, cancel: CancellationToken) {
        let lease_token = supervisor.lease_token().clone();
        let result = supervisor.run(cancel).await;
        let lease = supervisor.lease().await;

        match result {
            Ok(()) => self.release(lease).await,
            Err(e) if e.is_lease_lost() => {
                LeaseMetrics::increment_leases_lost();
                info!(lease_token = %lease_token, "Partition handed over to another host");
            }
            Err(LeaseError::PartitionGone { .. }) => {
                if let Err(e) = self.synchronizer.split_partition(&lease).await {
                    warn!(lease_token = %lease_token, error = %e, "Failed to replace lease of retired partition");
                    self.health
                        .inspect(HealthMonitoringRecord::error(
                            MonitoredOperation::ReadFeed,
                            Some(&lease_token),
                            &e,
                        ))
                        .await;
                    self.release(lease).await;
                }
            }
            Err(_) => self.release(lease).await,
        }

        let mut running = self.running.lock();
        running.remove(&lease_token);
        LeaseMetrics::set_owned_partitions(running.len());
    }

    async fn release(&self, lease: Lease) {
        let lease_token = lease.lease_token.clone();
        match self.manager.release(lease).await {
            Ok(()) => {}
            Err(e) if e.is_lease_lost() => {
                debug!(lease_token = %lease_token, "Lease already taken over, nothing to release");
            }
            Err(e) => {
                warn!(lease_token = %lease_token, error = %e, "Failed to release lease");
                self.health
                    .inspect(HealthMonitoringRecord::error(
                        MonitoredOperation::ReleaseLease,
                        Some(&lease_token),
                        &e,
                    ))
                    .await;
            }
        }
    }

    /// Stop every partition and wait for their leases to be released
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let partitions: Vec<(LeaseToken, RunningPartition)> = self.running.lock().drain().collect();
        info!(host = %self.host(), partitions = partitions.len(), "Stopping partition controller");

        for (lease_token, partition) in partitions {
            if let Err(e) = partition.handle.await {
                warn!(lease_token = %lease_token, error = %e, "Partition task panicked");
            }
        }
        LeaseMetrics::set_owned_partitions(0);
    }
}
