//! Periodic lease renewal
//!
//! A held lease is renewed right away and then on every tick of the renew
//! interval. A host that keeps renewing keeps its lease: nothing else writes
//! to the lease unless another host decides to take it, so an uncontested
//! renewal always succeeds.

use crate::checkpointer::SharedLease;
use crate::error::LeaseResult;
use crate::lease_manager::LeaseManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keeps one lease alive while its partition is processed
pub struct LeaseRenewer {
    lease: SharedLease,
    manager: Arc<dyn LeaseManager>,
    interval: Duration,
}

impl LeaseRenewer {
    pub fn new(lease: SharedLease, manager: Arc<dyn LeaseManager>, interval: Duration) -> Self {
        Self {
            lease,
            manager,
            interval,
        }
    }

    /// Renew once, replacing the shared lease on success
    pub async fn renew(&self) -> LeaseResult<()> {
        let mut held = self.lease.lock().await;
        let renewed = self.manager.renew(held.clone()).await?;
        *held = renewed;
        Ok(())
    }

    /// Renew until `cancel` fires or the lease is lost.
    ///
    /// Returns the lease-lost error; any other failure is logged and the
    /// renewal is tried again on the next tick.
    pub async fn run(&self, cancel: CancellationToken) -> LeaseResult<()> {
        let lease_token = self.lease.lease_token().clone();
        debug!(lease_token = %lease_token, interval = ?self.interval, "Lease renewer started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.renew().await {
                Ok(()) => {}
                Err(e) if e.is_lease_lost() => {
                    warn!(lease_token = %lease_token, error = %e, "Lease lost during renewal");
                    return Err(e);
                }
                Err(e) => {
                    warn!(lease_token = %lease_token, error = %e, "Lease renewal failed, retrying on next tick");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!(lease_token = %lease_token, "Lease renewer stopped");
        Ok(())
    }
}
