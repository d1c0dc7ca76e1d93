//! Durable progress recording for one partition

use crate::error::LeaseResult;
use crate::lease::Lease;
use crate::lease_manager::LeaseManager;
use crate::types::LeaseToken;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// The in-memory copy of a held lease.
///
/// Renewals and checkpoints for one partition both go through the same
/// `SharedLease`, so at most one conditional write per lease is in flight on
/// this host and each write starts from the version the previous one
/// produced.
#[derive(Clone)]
pub struct SharedLease {
    lease_token: LeaseToken,
    inner: Arc<Mutex<Lease>>,
}

impl SharedLease {
    pub fn new(lease: Lease) -> Self {
        Self {
            lease_token: lease.lease_token.clone(),
            inner: Arc::new(Mutex::new(lease)),
        }
    }

    pub fn lease_token(&self) -> &LeaseToken {
        &self.lease_token
    }

    /// Copy of the latest known lease state
    pub async fn snapshot(&self) -> Lease {
        self.inner.lock().await.clone()
    }

    /// Exclusive access for the duration of one store write
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Lease> {
        self.inner.lock().await
    }
}

/// Records a continuation token for the partition it is bound to
#[async_trait]
pub trait PartitionCheckpointer: Send + Sync {
    async fn checkpoint_partition(&self, continuation_token: &str) -> LeaseResult<()>;
}

/// [`PartitionCheckpointer`] that writes through a [`LeaseManager`]
pub struct LeaseCheckpointer {
    lease: SharedLease,
    manager: Arc<dyn LeaseManager>,
}

impl LeaseCheckpointer {
    pub fn new(lease: SharedLease, manager: Arc<dyn LeaseManager>) -> Self {
        Self { lease, manager }
    }
}

#[async_trait]
impl PartitionCheckpointer for LeaseCheckpointer {
    async fn checkpoint_partition(&self, continuation_token: &str) -> LeaseResult<()> {
        let mut held = self.lease.lock().await;
        let updated = self
            .manager
            .checkpoint(held.clone(), continuation_token.to_string())
            .await?;
        debug!(
            lease_token = %updated.lease_token,
            continuation = continuation_token,
            "Partition checkpoint stored"
        );
        *held = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_manager::DocumentLeaseManager;
    use crate::store::InMemoryDocumentStore;
    use crate::types::HostId;

    async fn held_lease(manager: &DocumentLeaseManager) -> Lease {
        let lease = manager
            .create_lease_if_not_exists(&LeaseToken::new("0"), None)
            .await
            .unwrap()
            .unwrap();
        manager.acquire(lease).await.unwrap()
    }

    #[tokio::test]
    async fn test_checkpoints_are_monotonic() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let manager = Arc::new(DocumentLeaseManager::new(
            store,
            "group",
            HostId::new("a"),
            5,
        ));
        let shared = SharedLease::new(held_lease(&manager).await);
        let checkpointer = LeaseCheckpointer::new(shared.clone(), manager.clone());

        let mut stored = Vec::new();
        for position in ["10", "20", "35"] {
            checkpointer.checkpoint_partition(position).await.unwrap();
            let lease = manager.list_all_leases().await.unwrap().remove(0);
            stored.push(lease.continuation_token.unwrap());
        }

        assert_eq!(stored, vec!["10", "20", "35"]);
        assert_eq!(
            shared.snapshot().await.continuation_token.as_deref(),
            Some("35")
        );
    }

    #[tokio::test]
    async fn test_checkpoint_after_steal_is_lease_lost() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = Arc::new(DocumentLeaseManager::new(
            store.clone(),
            "group",
            HostId::new("a"),
            5,
        ));
        let b = DocumentLeaseManager::new(store, "group", HostId::new("b"), 5);
        let shared = SharedLease::new(held_lease(&a).await);
        let checkpointer = LeaseCheckpointer::new(shared.clone(), a.clone());

        b.acquire(b.list_all_leases().await.unwrap().remove(0))
            .await
            .unwrap();

        let err = checkpointer.checkpoint_partition("5").await.unwrap_err();
        assert!(err.is_lease_lost());
        // the cached lease is left as it was
        assert!(shared.snapshot().await.continuation_token.is_none());
    }
}
