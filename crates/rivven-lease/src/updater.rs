//! Optimistic lease updates
//!
//! Every lease mutation is a compare-and-swap on the lease's version token.
//! A version conflict is ordinary control flow: the updater re-reads the
//! stored lease and re-applies the caller's update function, up to a fixed
//! number of attempts. A missing document means another actor deleted the
//! lease, which ends the caller's session.

use crate::error::{LeaseError, LeaseResult, StoreError};
use crate::lease::Lease;
use crate::observability::LeaseMetrics;
use crate::store::DocumentStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of conditional writes attempted per update
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Applies update functions to leases with conflict retries
#[derive(Clone)]
pub struct LeaseUpdater {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl LeaseUpdater {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_max_attempts(store, DEFAULT_MAX_UPDATE_ATTEMPTS)
    }

    pub fn with_max_attempts(store: Arc<dyn DocumentStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply `update_fn` to `cached` and write the result back.
    ///
    /// `update_fn` receives the most recent known version of the lease and
    /// returns the desired new state, `None` to skip the write, or an error
    /// (typically lease-lost) to abort. It is re-invoked with the freshly
    /// read lease after every version conflict.
    ///
    /// Returns the lease as stored, carrying its new version token.
    pub async fn update_lease<F>(&self, cached: Lease, mut update_fn: F) -> LeaseResult<Lease>
    where
        F: FnMut(Lease) -> LeaseResult<Option<Lease>> + Send,
    {
        let lease_token = cached.lease_token.clone();
        let mut lease = cached;

        for attempt in 1..=self.max_attempts {
            let mut updated = match update_fn(lease.clone())? {
                Some(updated) => updated,
                None => return Ok(lease),
            };
            updated.timestamp = Utc::now();

            let document = updated.to_document()?;
            match self
                .store
                .replace_item(document, &lease.concurrency_token)
                .await
            {
                Ok(stored) => return Lease::from_document(stored),
                Err(StoreError::PreconditionFailed(_)) => {
                    LeaseMetrics::increment_conflict_retries();
                    if attempt == self.max_attempts {
                        break;
                    }

                    let current = match self.store.read_item(&lease.id).await {
                        Ok(document) => Lease::from_document(document)?,
                        Err(StoreError::NotFound(_)) => {
                            return Err(LeaseError::lease_lost(
                                &lease_token,
                                "lease document deleted during update",
                            ));
                        }
                        Err(e) => return Err(LeaseError::from_store(&lease_token, e)),
                    };

                    debug!(
                        lease_token = %lease_token,
                        attempt,
                        expected_owner = ?lease.owner,
                        current_owner = ?current.owner,
                        expected_version = %lease.concurrency_token,
                        current_version = %current.concurrency_token,
                        "Lease changed concurrently, retrying update"
                    );
                    lease = current;
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(LeaseError::lease_lost(
                        &lease_token,
                        "lease document not found",
                    ));
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(LeaseError::lease_lost(
                        &lease_token,
                        "lease document was replaced by another host",
                    ));
                }
                Err(e) => return Err(LeaseError::from_store(&lease_token, e)),
            }
        }

        warn!(
            lease_token = %lease_token,
            attempts = self.max_attempts,
            "Lease update gave up after repeated version conflicts"
        );
        Err(LeaseError::VersionConflict {
            lease_token,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDocumentStore, StoreOperation};
    use crate::types::{HostId, LeaseToken};

    async fn seeded(store: &Arc<InMemoryDocumentStore>) -> Lease {
        let lease = Lease::new("p", LeaseToken::new("0"), None);
        let created = store.create_item(lease.to_document().unwrap()).await.unwrap();
        Lease::from_document(created).unwrap()
    }

    fn set_owner(owner: &'static str) -> impl FnMut(Lease) -> LeaseResult<Option<Lease>> + Send {
        move |mut lease| {
            lease.owner = Some(HostId::new(owner));
            Ok(Some(lease))
        }
    }

    #[tokio::test]
    async fn test_update_returns_stored_lease() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        let updater = LeaseUpdater::new(store.clone());

        let updated = updater
            .update_lease(lease.clone(), set_owner("a"))
            .await
            .unwrap();

        assert_eq!(updated.owner, Some(HostId::new("a")));
        assert_ne!(updated.concurrency_token, lease.concurrency_token);
        assert!(updated.timestamp >= lease.timestamp);
    }

    #[tokio::test]
    async fn test_noop_update_skips_write() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        let updater = LeaseUpdater::new(store.clone());

        let result = updater
            .update_lease(lease.clone(), |_| Ok(None))
            .await
            .unwrap();

        assert_eq!(result, lease);
        assert_eq!(store.call_count(StoreOperation::Replace), 0);
    }

    #[tokio::test]
    async fn test_conflict_reapplies_update_on_fresh_lease() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let stale = seeded(&store).await;
        let updater = LeaseUpdater::new(store.clone());

        // another host checkpoints first
        let mut other = stale.clone();
        other.continuation_token = Some("10".into());
        store
            .replace_item(other.to_document().unwrap(), &stale.concurrency_token)
            .await
            .unwrap();

        let mut seen = Vec::new();
        let updated = updater
            .update_lease(stale, |mut lease| {
                seen.push(lease.continuation_token.clone());
                lease.owner = Some(HostId::new("a"));
                Ok(Some(lease))
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![None, Some("10".to_string())]);
        assert_eq!(updated.continuation_token.as_deref(), Some("10"));
        assert_eq!(updated.owner, Some(HostId::new("a")));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        for _ in 0..6 {
            store.inject_fault(
                StoreOperation::Replace,
                StoreError::PreconditionFailed(lease.id.clone()),
            );
        }
        let updater = LeaseUpdater::new(store.clone());

        let err = updater
            .update_lease(lease, set_owner("a"))
            .await
            .unwrap_err();

        assert!(err.is_version_conflict());
        assert_eq!(store.call_count(StoreOperation::Replace), 5);
    }

    #[tokio::test]
    async fn test_configured_budget_is_honoured() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        for _ in 0..3 {
            store.inject_fault(
                StoreOperation::Replace,
                StoreError::PreconditionFailed(lease.id.clone()),
            );
        }
        let updater = LeaseUpdater::with_max_attempts(store.clone(), 2);

        assert!(updater
            .update_lease(lease, set_owner("a"))
            .await
            .unwrap_err()
            .is_version_conflict());
        assert_eq!(store.call_count(StoreOperation::Replace), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_lease_lost_without_retry() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        store.delete_item(&lease.id, None).await.unwrap();
        let updater = LeaseUpdater::new(store.clone());

        let err = updater
            .update_lease(lease, set_owner("a"))
            .await
            .unwrap_err();

        assert!(err.is_lease_lost());
        assert_eq!(store.call_count(StoreOperation::Replace), 1);
    }

    #[tokio::test]
    async fn test_conflict_response_is_lease_lost() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        store.inject_fault(StoreOperation::Replace, StoreError::Conflict(lease.id.clone()));
        let updater = LeaseUpdater::new(store.clone());

        let err = updater
            .update_lease(lease, set_owner("a"))
            .await
            .unwrap_err();

        assert!(err.is_lease_lost());
        assert!(!err.is_version_conflict());
        assert_eq!(store.call_count(StoreOperation::Replace), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_retried() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        store.inject_fault(
            StoreOperation::Replace,
            StoreError::Unavailable("throttled".into()),
        );
        let updater = LeaseUpdater::new(store.clone());

        let err = updater
            .update_lease(lease, set_owner("a"))
            .await
            .unwrap_err();

        assert!(matches!(err, LeaseError::StoreUnavailable(_)));
        assert_eq!(store.call_count(StoreOperation::Replace), 1);
    }

    #[tokio::test]
    async fn test_racing_updates_with_same_token() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let lease = seeded(&store).await;
        let updater = LeaseUpdater::with_max_attempts(store.clone(), 1);

        let (a, b) = tokio::join!(
            updater.update_lease(lease.clone(), set_owner("a")),
            updater.update_lease(lease.clone(), set_owner("b")),
        );

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(loser.unwrap_err().is_version_conflict());
    }
}
