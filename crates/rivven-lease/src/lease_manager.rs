//! Lease CRUD over the shared document store
//!
//! [`LeaseManager`] is the contract the rest of the machinery programs
//! against. [`DocumentLeaseManager`] implements it on top of any
//! [`DocumentStore`], routing every ownership change through the
//! [`LeaseUpdater`] so that version conflicts are retried and lease loss is
//! detected the same way everywhere.

use crate::error::{LeaseError, LeaseResult, StoreError};
use crate::lease::{is_lease_document, Lease};
use crate::observability::LeaseMetrics;
use crate::store::DocumentStore;
use crate::types::{HostId, LeaseToken};
use crate::updater::LeaseUpdater;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Operations on the lease documents of one consumer group
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Host on whose behalf ownership changes are made
    fn host(&self) -> &HostId;

    /// Create an unowned lease for a partition.
    ///
    /// Returns `None` if a lease for the partition already exists.
    async fn create_lease_if_not_exists(
        &self,
        lease_token: &LeaseToken,
        continuation_token: Option<String>,
    ) -> LeaseResult<Option<Lease>>;

    /// Every lease of the consumer group
    async fn list_all_leases(&self) -> LeaseResult<Vec<Lease>>;

    /// Leases currently recorded as owned by this host
    async fn list_owned_leases(&self) -> LeaseResult<Vec<Lease>> {
        let host = self.host().clone();
        Ok(self
            .list_all_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.is_owned_by(&host))
            .collect())
    }

    /// Take ownership of a lease that is unowned, expired, or being stolen
    async fn acquire(&self, lease: Lease) -> LeaseResult<Lease>;

    /// Refresh the timestamp of a lease held by this host
    async fn renew(&self, lease: Lease) -> LeaseResult<Lease>;

    /// Give up a lease held by this host
    async fn release(&self, lease: Lease) -> LeaseResult<()>;

    /// Record a new continuation token on a lease held by this host
    async fn checkpoint(&self, lease: Lease, continuation_token: String) -> LeaseResult<Lease>;

    /// Replace the properties of a lease held by this host
    async fn update_properties(&self, lease: Lease) -> LeaseResult<Lease>;

    /// Remove a lease whose partition no longer exists
    async fn delete(&self, lease: &Lease) -> LeaseResult<()>;
}

/// [`LeaseManager`] backed by a [`DocumentStore`]
pub struct DocumentLeaseManager {
    store: Arc<dyn DocumentStore>,
    updater: LeaseUpdater,
    prefix: String,
    host: HostId,
}

impl DocumentLeaseManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        prefix: impl Into<String>,
        host: HostId,
        max_update_attempts: u32,
    ) -> Self {
        Self {
            updater: LeaseUpdater::with_max_attempts(store.clone(), max_update_attempts),
            store,
            prefix: prefix.into(),
            host,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn require_owner(&self, lease: &Lease) -> LeaseResult<()> {
        if lease.is_owned_by(&self.host) {
            Ok(())
        } else {
            Err(LeaseError::lease_lost(
                &lease.lease_token,
                format!(
                    "owned by {}",
                    lease.owner.as_ref().map(|o| o.as_str()).unwrap_or("nobody")
                ),
            ))
        }
    }
}

#[async_trait]
impl LeaseManager for DocumentLeaseManager {
    fn host(&self) -> &HostId {
        &self.host
    }

    async fn create_lease_if_not_exists(
        &self,
        lease_token: &LeaseToken,
        continuation_token: Option<String>,
    ) -> LeaseResult<Option<Lease>> {
        let lease = Lease::new(&self.prefix, lease_token.clone(), continuation_token);
        match self.store.create_item(lease.to_document()?).await {
            Ok(stored) => {
                info!(lease_token = %lease_token, continuation = ?lease.continuation_token, "Created lease");
                Ok(Some(Lease::from_document(stored)?))
            }
            Err(StoreError::Conflict(_)) => {
                debug!(lease_token = %lease_token, "Lease already exists");
                Ok(None)
            }
            Err(e) => Err(LeaseError::from_store(lease_token, e)),
        }
    }

    async fn list_all_leases(&self) -> LeaseResult<Vec<Lease>> {
        let namespace = format!("{}.", self.prefix);
        let documents: Vec<_> = self
            .store
            .enumerate_items(&namespace)
            .await
            .map_err(store_listing_error)?
            .try_collect()
            .await
            .map_err(store_listing_error)?;

        documents
            .into_iter()
            .filter(|document| is_lease_document(&self.prefix, &document.id))
            .map(Lease::from_document)
            .collect()
    }

    async fn acquire(&self, lease: Lease) -> LeaseResult<Lease> {
        let observed_owner = lease.owner.clone();
        let observed_timestamp = lease.timestamp;
        let host = self.host.clone();
        let mut retried = false;

        let acquired = self
            .updater
            .update_lease(lease, |mut current| {
                // a fresh read showing a new owner, or a live owner that wrote
                // since we looked, means the takeover lost
                if retried {
                    if current.owner != observed_owner {
                        return Err(LeaseError::lease_lost(
                            &current.lease_token,
                            format!(
                                "acquired concurrently by {}",
                                current.owner.as_ref().map(|o| o.as_str()).unwrap_or("nobody")
                            ),
                        ));
                    }
                    if let Some(owner) = current.owner.as_ref() {
                        if owner != &host && current.timestamp != observed_timestamp {
                            return Err(LeaseError::lease_lost(
                                &current.lease_token,
                                format!("renewed concurrently by {owner}"),
                            ));
                        }
                    }
                }
                retried = true;
                current.owner = Some(host.clone());
                Ok(Some(current))
            })
            .await?;

        LeaseMetrics::increment_acquisitions();
        info!(
            lease_token = %acquired.lease_token,
            previous_owner = ?observed_owner,
            "Acquired lease"
        );
        Ok(acquired)
    }

    async fn renew(&self, lease: Lease) -> LeaseResult<Lease> {
        let renewed = self
            .updater
            .update_lease(lease, |current| {
                self.require_owner(&current)?;
                Ok(Some(current))
            })
            .await?;

        LeaseMetrics::increment_renewals();
        debug!(lease_token = %renewed.lease_token, "Renewed lease");
        Ok(renewed)
    }

    async fn release(&self, lease: Lease) -> LeaseResult<()> {
        let lease_token = lease.lease_token.clone();
        self.updater
            .update_lease(lease, |mut current| {
                self.require_owner(&current)?;
                current.owner = None;
                Ok(Some(current))
            })
            .await?;

        LeaseMetrics::increment_releases();
        info!(lease_token = %lease_token, "Released lease");
        Ok(())
    }

    async fn checkpoint(&self, lease: Lease, continuation_token: String) -> LeaseResult<Lease> {
        let updated = self
            .updater
            .update_lease(lease, |mut current| {
                self.require_owner(&current)?;
                current.continuation_token = Some(continuation_token.clone());
                Ok(Some(current))
            })
            .await?;

        LeaseMetrics::increment_checkpoints();
        debug!(
            lease_token = %updated.lease_token,
            continuation = %continuation_token,
            "Checkpointed lease"
        );
        Ok(updated)
    }

    async fn update_properties(&self, lease: Lease) -> LeaseResult<Lease> {
        let properties = lease.properties.clone();
        self.updater
            .update_lease(lease, |mut current| {
                self.require_owner(&current)?;
                if current.properties == properties {
                    return Ok(None);
                }
                current.properties = properties.clone();
                Ok(Some(current))
            })
            .await
    }

    async fn delete(&self, lease: &Lease) -> LeaseResult<()> {
        match self.store.delete_item(&lease.id, None).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                info!(lease_token = %lease.lease_token, "Deleted lease");
                Ok(())
            }
            Err(e) => Err(LeaseError::from_store(&lease.lease_token, e)),
        }
    }
}

fn store_listing_error(err: StoreError) -> LeaseError {
    match err {
        StoreError::Serialization(msg) => LeaseError::Serialization(msg),
        other => LeaseError::StoreUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDocumentStore, StoreOperation};

    fn manager(store: &Arc<InMemoryDocumentStore>, host: &str) -> DocumentLeaseManager {
        DocumentLeaseManager::new(store.clone(), "group", HostId::new(host), 5)
    }

    async fn created(manager: &DocumentLeaseManager, token: &str) -> Lease {
        manager
            .create_lease_if_not_exists(&LeaseToken::new(token), None)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");

        assert!(a
            .create_lease_if_not_exists(&LeaseToken::new("0"), Some("5".into()))
            .await
            .unwrap()
            .is_some());
        assert!(a
            .create_lease_if_not_exists(&LeaseToken::new("0"), None)
            .await
            .unwrap()
            .is_none());

        let leases = a.list_all_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].continuation_token.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_listing_skips_markers_and_other_groups() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        created(&a, "0").await;
        created(&a, "1").await;
        store
            .create_item(crate::store::Document::new(
                "group.info",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let other = DocumentLeaseManager::new(store.clone(), "group2", HostId::new("a"), 5);
        created(&other, "0").await;

        let tokens: Vec<String> = a
            .list_all_leases()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.lease_token.0)
            .collect();
        assert_eq!(tokens, vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_acquire_and_list_owned() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let lease = created(&a, "0").await;
        created(&a, "1").await;

        let acquired = a.acquire(lease).await.unwrap();
        assert!(acquired.is_owned_by(&HostId::new("a")));

        let owned = a.list_owned_leases().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].lease_token, LeaseToken::new("0"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let lease = created(&a, "0").await;

        let (ra, rb) = tokio::join!(a.acquire(lease.clone()), b.acquire(lease.clone()));

        assert!(ra.is_ok());
        let err = rb.unwrap_err();
        assert!(err.is_lease_lost());

        let stored = a.list_all_leases().await.unwrap();
        assert_eq!(stored[0].owner, Some(HostId::new("a")));
    }

    #[tokio::test]
    async fn test_takeover_fails_when_owner_renewed_meanwhile() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let held = a.acquire(created(&a, "0").await).await.unwrap();

        let seen_by_b = b.list_all_leases().await.unwrap().remove(0);
        a.renew(held).await.unwrap();

        let err = b.acquire(seen_by_b).await.unwrap_err();
        assert!(err.is_lease_lost());
        let stored = a.list_all_leases().await.unwrap().remove(0);
        assert_eq!(stored.owner, Some(HostId::new("a")));
    }

    #[tokio::test]
    async fn test_acquire_retries_past_release_of_unowned_lease() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let unowned = created(&a, "0").await;

        // a acquires and releases again: the lease is unowned but re-versioned
        let held = a.acquire(unowned.clone()).await.unwrap();
        a.release(held).await.unwrap();

        let acquired = b.acquire(unowned).await.unwrap();
        assert_eq!(acquired.owner, Some(HostId::new("b")));
    }

    #[tokio::test]
    async fn test_steal_then_renew_is_lease_lost() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let held = a.acquire(created(&a, "0").await).await.unwrap();

        let seen_by_b = b.list_all_leases().await.unwrap().remove(0);
        b.acquire(seen_by_b).await.unwrap();

        let err = a.renew(held).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert!(!err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_checkpoint_survives_concurrent_renewal() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let held = a.acquire(created(&a, "0").await).await.unwrap();

        a.renew(held.clone()).await.unwrap();
        // stale version token: the updater re-reads and re-applies
        let checkpointed = a.checkpoint(held, "42".into()).await.unwrap();

        assert_eq!(checkpointed.continuation_token.as_deref(), Some("42"));
        assert_eq!(store.call_count(StoreOperation::Replace), 4);
    }

    #[tokio::test]
    async fn test_release_clears_owner() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let held = a.acquire(created(&a, "0").await).await.unwrap();

        a.release(held).await.unwrap();

        let lease = a.list_all_leases().await.unwrap().remove(0);
        assert!(lease.owner.is_none());
        assert!(a.list_owned_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_of_unowned_lease_is_lease_lost() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let lease = created(&a, "0").await;

        assert!(a.release(lease).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_update_properties() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let mut held = a.acquire(created(&a, "0").await).await.unwrap();

        held.properties.insert("region".into(), "eu".into());
        let updated = a.update_properties(held.clone()).await.unwrap();
        assert_eq!(updated.properties.get("region").map(String::as_str), Some("eu"));

        let writes = store.call_count(StoreOperation::Replace);
        a.update_properties(updated).await.unwrap();
        assert_eq!(store.call_count(StoreOperation::Replace), writes);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_lease() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let a = manager(&store, "a");
        let lease = created(&a, "0").await;

        a.delete(&lease).await.unwrap();
        a.delete(&lease).await.unwrap();
        assert!(a.list_all_leases().await.unwrap().is_empty());
    }
}
