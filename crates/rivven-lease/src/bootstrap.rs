//! Fleet-wide bootstrap of a consumer group
//!
//! The first host to start creates the leases for every partition under the
//! bootstrap lock and then writes the initialized marker. Hosts that find
//! the lock taken wait and check the marker again.

use crate::error::LeaseResult;
use crate::lease_store::LeaseStore;
use crate::synchronizer::PartitionSynchronizer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs the bootstrap protocol for one host
pub struct Bootstrapper {
    lease_store: Arc<LeaseStore>,
    synchronizer: Arc<PartitionSynchronizer>,
    lock_ttl: Duration,
    retry_delay: Duration,
}

impl Bootstrapper {
    pub fn new(
        lease_store: Arc<LeaseStore>,
        synchronizer: Arc<PartitionSynchronizer>,
        lock_ttl: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            lease_store,
            synchronizer,
            lock_ttl,
            retry_delay,
        }
    }

    /// Make sure the group is bootstrapped.
    ///
    /// Returns `true` if this host did the bootstrap, `false` if the group
    /// was already initialized by someone else.
    pub async fn initialize(&self) -> LeaseResult<bool> {
        loop {
            if self.lease_store.is_initialized().await? {
                debug!("Consumer group already initialized");
                return Ok(false);
            }

            if !self
                .lease_store
                .acquire_initialization_lock(self.lock_ttl)
                .await?
            {
                debug!(retry_in = ?self.retry_delay, "Another host is bootstrapping");
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            let outcome = self.bootstrap_locked().await;
            if let Err(e) = self.lease_store.release_initialization_lock().await {
                // the TTL frees the lock eventually
                warn!(error = %e, "Failed to release bootstrap lock");
            }
            return outcome;
        }
    }

    async fn bootstrap_locked(&self) -> LeaseResult<bool> {
        // the previous lock holder may have finished just before its lock expired
        if self.lease_store.is_initialized().await? {
            return Ok(false);
        }
        let created = self.synchronizer.create_missing_leases().await?;
        let marked = self.lease_store.mark_initialized().await?;
        info!(leases = created, "Consumer group bootstrapped");
        Ok(marked)
    }
}
