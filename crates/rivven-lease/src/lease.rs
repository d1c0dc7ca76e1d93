//! Lease document
//!
//! One lease exists per partition of the change feed. It records who owns
//! the partition and how far the owner has durably processed it.
//!
//! Lease documents live next to two marker documents in the same store:
//!
//! ```text
//! <prefix>.info          bootstrap marker
//! <prefix>.lock          bootstrap lock (TTL)
//! <prefix>.<leaseToken>  one per partition
//! ```

use crate::error::LeaseResult;
use crate::store::{Document, VersionedDocument};
use crate::types::{ConcurrencyToken, HostId, LeaseToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Suffix of the bootstrap marker document
pub const INFO_SUFFIX: &str = "info";

/// Suffix of the bootstrap lock document
pub const LOCK_SUFFIX: &str = "lock";

/// Ownership record for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Document id in the shared store
    pub id: String,
    /// Partition this lease governs
    pub lease_token: LeaseToken,
    /// Current owner, `None` when the lease is free
    #[serde(default)]
    pub owner: Option<HostId>,
    /// Last durably checkpointed position in the partition
    #[serde(default)]
    pub continuation_token: Option<String>,
    /// Last time the lease was created, acquired, renewed or checkpointed
    pub timestamp: DateTime<Utc>,
    /// Free-form properties attached by the owner
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Version token from the last read or write; not part of the body
    #[serde(skip)]
    pub concurrency_token: ConcurrencyToken,
}

impl Lease {
    /// Create a new, unowned lease for a partition
    pub fn new(prefix: &str, lease_token: LeaseToken, continuation_token: Option<String>) -> Self {
        Self {
            id: lease_document_id(prefix, &lease_token),
            lease_token,
            owner: None,
            continuation_token,
            timestamp: Utc::now(),
            properties: HashMap::new(),
            concurrency_token: ConcurrencyToken::default(),
        }
    }

    /// Check whether `host` is the recorded owner
    pub fn is_owned_by(&self, host: &HostId) -> bool {
        self.owner.as_ref() == Some(host)
    }

    /// Check whether the lease can be taken without stealing it.
    ///
    /// A lease is expired when it has no owner, or when the owner has not
    /// renewed it within `expiration`.
    pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        if self.owner.is_none() {
            return true;
        }
        match chrono::Duration::from_std(expiration) {
            Ok(window) => self.timestamp + window < now,
            Err(_) => false,
        }
    }

    /// Encode the lease as a store document
    pub fn to_document(&self) -> LeaseResult<Document> {
        Ok(Document::new(self.id.clone(), serde_json::to_value(self)?))
    }

    /// Decode a lease from a store document, adopting its version token
    pub fn from_document(document: VersionedDocument) -> LeaseResult<Self> {
        let mut lease: Lease = serde_json::from_value(document.body)?;
        lease.concurrency_token = document.version;
        Ok(lease)
    }

    /// Time since the last write to this lease
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} owner={} continuation={} timestamp={}",
            self.lease_token,
            self.owner.as_ref().map(|o| o.as_str()).unwrap_or("<none>"),
            self.continuation_token.as_deref().unwrap_or("<none>"),
            self.timestamp.to_rfc3339()
        )
    }
}

/// Document id of the lease for `lease_token`
pub fn lease_document_id(prefix: &str, lease_token: &LeaseToken) -> String {
    format!("{}.{}", prefix, lease_token.0)
}

/// Document id of the bootstrap marker
pub fn info_document_id(prefix: &str) -> String {
    format!("{}.{}", prefix, INFO_SUFFIX)
}

/// Document id of the bootstrap lock
pub fn lock_document_id(prefix: &str) -> String {
    format!("{}.{}", prefix, LOCK_SUFFIX)
}

/// Check whether a document id in the lease namespace is a lease (not a marker)
pub fn is_lease_document(prefix: &str, id: &str) -> bool {
    id != info_document_id(prefix) && id != lock_document_id(prefix)
}
