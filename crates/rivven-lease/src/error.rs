//! Error types for rivven-lease
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`] is what a [`DocumentStore`](crate::store::DocumentStore)
//!   reports for a single request (not found, precondition failed, ...).
//! - [`LeaseError`] is what the lease machinery surfaces to its callers. The
//!   updater translates store outcomes into this taxonomy.

use crate::types::LeaseToken;
use thiserror::Error;

/// Result type alias for lease operations
pub type LeaseResult<T> = std::result::Result<T, LeaseError>;

/// Result type alias for raw store requests
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a failed request against the shared document store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed document does not exist
    #[error("document not found: {0}")]
    NotFound(String),

    /// A document with the same id already exists
    #[error("document already exists: {0}")]
    Conflict(String),

    /// The supplied version token no longer matches the stored one
    #[error("precondition failed for document: {0}")]
    PreconditionFailed(String),

    /// The store could not be reached or rejected the request transiently
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The document body could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Main error type for lease management
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The retry budget for optimistic updates was exhausted
    #[error("version conflict on lease '{lease_token}' after {attempts} attempt(s)")]
    VersionConflict {
        lease_token: LeaseToken,
        attempts: u32,
    },

    /// The lease was deleted or taken over by another host
    #[error("lease '{lease_token}' lost: {reason}")]
    LeaseLost {
        lease_token: LeaseToken,
        reason: String,
    },

    /// Transient store failure; never retried by the lease layer
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The feed reports the partition no longer exists (split or retired)
    #[error("partition '{lease_token}' is gone")]
    PartitionGone { lease_token: LeaseToken },

    /// Business logic failed while processing changes
    #[error("observer failed on lease '{lease_token}': {message}")]
    Observer {
        lease_token: LeaseToken,
        message: String,
    },

    /// Invalid configuration or missing dependency
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

impl From<serde_json::Error> for LeaseError {
    fn from(err: serde_json::Error) -> Self {
        LeaseError::Serialization(err.to_string())
    }
}

impl LeaseError {
    /// Create an invalid-argument error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a lease-lost error
    pub fn lease_lost(lease_token: &LeaseToken, reason: impl Into<String>) -> Self {
        Self::LeaseLost {
            lease_token: lease_token.clone(),
            reason: reason.into(),
        }
    }

    /// Create an observer error
    pub fn observer(lease_token: &LeaseToken, msg: impl Into<String>) -> Self {
        Self::Observer {
            lease_token: lease_token.clone(),
            message: msg.into(),
        }
    }

    /// Check if the lease is no longer held by this host
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// Check if the retry budget was exhausted by version conflicts
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Check if this is a shutdown error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Translate a store failure that is not handled specially by the caller
    pub(crate) fn from_store(lease_token: &LeaseToken, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::lease_lost(lease_token, "lease document not found"),
            StoreError::Conflict(_) => {
                Self::lease_lost(lease_token, "lease document was created by another host")
            }
            StoreError::PreconditionFailed(_) => Self::VersionConflict {
                lease_token: lease_token.clone(),
                attempts: 1,
            },
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LeaseError::lease_lost(&LeaseToken::new("0"), "stolen");
        assert_eq!(err.to_string(), "lease '0' lost: stolen");

        let err = LeaseError::VersionConflict {
            lease_token: LeaseToken::new("7"),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "version conflict on lease '7' after 5 attempt(s)"
        );
    }

    #[test]
    fn test_store_error_classification() {
        let token = LeaseToken::new("1");

        assert!(LeaseError::from_store(&token, StoreError::NotFound("x".into())).is_lease_lost());
        assert!(LeaseError::from_store(&token, StoreError::Conflict("x".into())).is_lease_lost());
        assert!(
            LeaseError::from_store(&token, StoreError::PreconditionFailed("x".into()))
                .is_version_conflict()
        );
        assert!(matches!(
            LeaseError::from_store(&token, StoreError::Unavailable("down".into())),
            LeaseError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_shutdown_check() {
        assert!(LeaseError::Shutdown.is_shutdown());
        assert!(!LeaseError::config("bad").is_shutdown());
    }
}
