//! Shared document store boundary
//!
//! The lease machinery coordinates hosts exclusively through a versioned
//! document store. Any backend with conditional writes can implement
//! [`DocumentStore`]: document databases with ETags, key-value stores with
//! compare-and-swap, or relational tables with a version column.
//!
//! Partition discovery is a separate capability ([`PartitionSource`]) because
//! it usually comes from the monitored feed rather than the lease store.

pub mod memory;

use crate::error::StoreResult;
use crate::types::{ConcurrencyToken, LeaseToken};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

pub use memory::{InMemoryChangeFeed, InMemoryDocumentStore, StoreOperation};

/// A document to be written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Unique document id
    pub id: String,
    /// JSON body
    pub body: serde_json::Value,
    /// Store-side time to live; `None` keeps the document until deleted
    pub ttl: Option<Duration>,
}

impl Document {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A document as returned by the store, together with its version token
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub id: String,
    pub body: serde_json::Value,
    pub version: ConcurrencyToken,
}

/// Versioned document store used as the coordination medium
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document by id
    async fn read_item(&self, id: &str) -> StoreResult<VersionedDocument>;

    /// Create a document; fails with `Conflict` if the id is taken
    async fn create_item(&self, document: Document) -> StoreResult<VersionedDocument>;

    /// Replace a document if its current version equals `if_match`
    async fn replace_item(
        &self,
        document: Document,
        if_match: &ConcurrencyToken,
    ) -> StoreResult<VersionedDocument>;

    /// Delete a document, optionally guarded by a version token
    async fn delete_item(&self, id: &str, if_match: Option<&ConcurrencyToken>) -> StoreResult<()>;

    /// Enumerate every document whose id starts with `prefix`.
    ///
    /// The stream is finite; callers re-enumerate to observe later changes.
    async fn enumerate_items(
        &self,
        prefix: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<VersionedDocument>>>;
}

/// Description of one partition of the monitored feed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionDescriptor {
    /// Lease token for the partition
    pub lease_token: LeaseToken,
    /// Partitions this one was split from, if any
    pub parents: Vec<LeaseToken>,
}

impl PartitionDescriptor {
    pub fn new(lease_token: impl Into<LeaseToken>) -> Self {
        Self {
            lease_token: lease_token.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<LeaseToken>) -> Self {
        self.parents.push(parent.into());
        self
    }
}

/// Source of the current partition set of the monitored feed
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Enumerate the live partitions
    async fn enumerate_partitions(
        &self,
    ) -> StoreResult<BoxStream<'static, StoreResult<PartitionDescriptor>>>;
}
