//! Consumer group bootstrap markers
//!
//! Two documents next to the leases record the bootstrap state of a group:
//! `<prefix>.info` exists once the lease set was created, and
//! `<prefix>.lock` exists (with a TTL) while one host is creating it.

use crate::error::{LeaseError, LeaseResult, StoreError};
use crate::lease::{info_document_id, lock_document_id};
use crate::store::{Document, DocumentStore};
use crate::types::HostId;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bootstrap state of one consumer group
pub struct LeaseStore {
    store: Arc<dyn DocumentStore>,
    prefix: String,
    host: HostId,
}

fn unavailable(err: StoreError) -> LeaseError {
    match err {
        StoreError::Serialization(msg) => LeaseError::Serialization(msg),
        other => LeaseError::StoreUnavailable(other.to_string()),
    }
}

impl LeaseStore {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: impl Into<String>, host: HostId) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            host,
        }
    }

    /// Whether some host already finished bootstrapping the group
    pub async fn is_initialized(&self) -> LeaseResult<bool> {
        match self.store.read_item(&info_document_id(&self.prefix)).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Record that the group is bootstrapped.
    ///
    /// Returns `false` when another host wrote the marker first.
    pub async fn mark_initialized(&self) -> LeaseResult<bool> {
        let document = Document::new(
            info_document_id(&self.prefix),
            json!({ "initialized_by": self.host.as_str(), "at": Utc::now() }),
        );
        match self.store.create_item(document).await {
            Ok(_) => {
                info!(prefix = %self.prefix, host = %self.host, "Consumer group marked initialized");
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Try to take the bootstrap lock for `ttl`.
    ///
    /// The store drops the lock on its own once the TTL runs out, so a host
    /// that dies while bootstrapping cannot block the group.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> LeaseResult<bool> {
        let document = Document::new(
            lock_document_id(&self.prefix),
            json!({ "owner": self.host.as_str() }),
        )
        .with_ttl(ttl);
        match self.store.create_item(document).await {
            Ok(_) => {
                debug!(prefix = %self.prefix, host = %self.host, ?ttl, "Bootstrap lock acquired");
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Drop the bootstrap lock; a lock that already expired is fine
    pub async fn release_initialization_lock(&self) -> LeaseResult<()> {
        match self
            .store
            .delete_item(&lock_document_id(&self.prefix), None)
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}
