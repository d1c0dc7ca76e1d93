//! In-memory store and feed implementations
//!
//! [`InMemoryDocumentStore`] honours the full [`DocumentStore`] contract
//! (version tokens, conditional replace and delete, TTL expiry, prefix
//! enumeration) and can be shared by several simulated hosts in one process.
//! It also supports fault injection so tests can script store failures.
//!
//! [`InMemoryChangeFeed`] is a partitioned, append-only feed whose
//! continuation tokens are positions in a feed-wide sequence. Partitions
//! created by a split continue the sequence of their parent, so a parent's
//! continuation token is a valid starting point for its children.

use super::{Document, DocumentStore, PartitionDescriptor, PartitionSource, VersionedDocument};
use crate::error::{LeaseError, LeaseResult, StoreError, StoreResult};
use crate::feed::{ChangeFeedReader, ChangeRecord, FeedPage, FeedReadOptions};
use crate::types::{ConcurrencyToken, LeaseToken};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::time::Instant;
use tracing::trace;

/// Store request kinds, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Read,
    Create,
    Replace,
    Delete,
    Enumerate,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    body: serde_json::Value,
    version: ConcurrencyToken,
    expires_at: Option<Instant>,
}

impl StoredDocument {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    fn to_versioned(&self, id: &str) -> VersionedDocument {
        VersionedDocument {
            id: id.to_string(),
            body: self.body.clone(),
            version: self.version.clone(),
        }
    }
}

/// Thread-safe in-memory document store
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<String, StoredDocument>>,
    faults: Mutex<HashMap<StoreOperation, VecDeque<StoreError>>>,
    calls: Mutex<HashMap<StoreOperation, u64>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next request of kind `operation` fail with `error`.
    ///
    /// Faults queue up: injecting three faults fails the next three requests.
    pub fn inject_fault(&self, operation: StoreOperation, error: StoreError) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Number of requests of kind `operation` seen so far (including failed ones)
    pub fn call_count(&self, operation: StoreOperation) -> u64 {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.documents
            .read()
            .values()
            .filter(|d| d.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self, operation: StoreOperation) -> StoreResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;
        match self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            Some(error) => {
                trace!(?operation, %error, "Injected store fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn store(documents: &mut BTreeMap<String, StoredDocument>, document: Document) -> VersionedDocument {
        let stored = StoredDocument {
            body: document.body,
            version: ConcurrencyToken::generate(),
            expires_at: document.ttl.map(|ttl| Instant::now() + ttl),
        };
        let versioned = stored.to_versioned(&document.id);
        documents.insert(document.id, stored);
        versioned
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read_item(&self, id: &str) -> StoreResult<VersionedDocument> {
        self.begin(StoreOperation::Read)?;
        let now = Instant::now();
        self.documents
            .read()
            .get(id)
            .filter(|d| d.is_live(now))
            .map(|d| d.to_versioned(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create_item(&self, document: Document) -> StoreResult<VersionedDocument> {
        self.begin(StoreOperation::Create)?;
        let now = Instant::now();
        let mut documents = self.documents.write();
        if documents
            .get(&document.id)
            .map(|d| d.is_live(now))
            .unwrap_or(false)
        {
            return Err(StoreError::Conflict(document.id));
        }
        Ok(Self::store(&mut documents, document))
    }

    async fn replace_item(
        &self,
        document: Document,
        if_match: &ConcurrencyToken,
    ) -> StoreResult<VersionedDocument> {
        self.begin(StoreOperation::Replace)?;
        let now = Instant::now();
        let mut documents = self.documents.write();
        match documents.get(&document.id).filter(|d| d.is_live(now)) {
            None => Err(StoreError::NotFound(document.id)),
            Some(current) if &current.version != if_match => {
                Err(StoreError::PreconditionFailed(document.id))
            }
            Some(_) => Ok(Self::store(&mut documents, document)),
        }
    }

    async fn delete_item(&self, id: &str, if_match: Option<&ConcurrencyToken>) -> StoreResult<()> {
        self.begin(StoreOperation::Delete)?;
        let now = Instant::now();
        let mut documents = self.documents.write();
        match documents.get(id).filter(|d| d.is_live(now)) {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(current) if if_match.is_some_and(|v| v != &current.version) => {
                Err(StoreError::PreconditionFailed(id.to_string()))
            }
            Some(_) => {
                documents.remove(id);
                Ok(())
            }
        }
    }

    async fn enumerate_items(
        &self,
        prefix: &str,
    ) -> StoreResult<BoxStream<'static, StoreResult<VersionedDocument>>> {
        self.begin(StoreOperation::Enumerate)?;
        let now = Instant::now();
        let snapshot: Vec<StoreResult<VersionedDocument>> = self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .filter(|(_, d)| d.is_live(now))
            .map(|(id, d)| Ok(d.to_versioned(id)))
            .collect();
        Ok(stream::iter(snapshot).boxed())
    }
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Position of the first record of this partition
    base: usize,
    records: Vec<ChangeRecord>,
    parents: Vec<LeaseToken>,
    gone: bool,
}

/// Partitioned append-only feed held in memory
#[derive(Default)]
pub struct InMemoryChangeFeed {
    partitions: RwLock<BTreeMap<LeaseToken, PartitionLog>>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LeaseToken>,
    {
        let feed = Self::new();
        for token in tokens {
            feed.add_partition(token);
        }
        feed
    }

    /// Register a new, empty partition
    pub fn add_partition(&self, token: impl Into<LeaseToken>) {
        self.partitions
            .write()
            .entry(token.into())
            .or_default();
    }

    /// Append a record to a live partition; returns its position
    pub fn append(&self, token: impl Into<LeaseToken>, record: ChangeRecord) -> Option<usize> {
        let mut partitions = self.partitions.write();
        let log = partitions.get_mut(&token.into()).filter(|l| !l.gone)?;
        log.records.push(record);
        Some(log.base + log.records.len() - 1)
    }

    /// Retire `parent` and create `children` that descend from it
    pub fn split<I, T>(&self, parent: impl Into<LeaseToken>, children: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<LeaseToken>,
    {
        let parent = parent.into();
        let mut partitions = self.partitions.write();
        let base = match partitions.get_mut(&parent) {
            Some(log) => {
                log.gone = true;
                log.base + log.records.len()
            }
            None => 0,
        };
        for child in children {
            partitions.insert(
                child.into(),
                PartitionLog {
                    base,
                    parents: vec![parent.clone()],
                    ..Default::default()
                },
            );
        }
    }

    /// Number of live partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.read().values().filter(|l| !l.gone).count()
    }
}

#[async_trait]
impl PartitionSource for InMemoryChangeFeed {
    async fn enumerate_partitions(
        &self,
    ) -> StoreResult<BoxStream<'static, StoreResult<PartitionDescriptor>>> {
        let descriptors: Vec<StoreResult<PartitionDescriptor>> = self
            .partitions
            .read()
            .iter()
            .filter(|(_, log)| !log.gone)
            .map(|(token, log)| {
                Ok(PartitionDescriptor {
                    lease_token: token.clone(),
                    parents: log.parents.clone(),
                })
            })
            .collect();
        Ok(stream::iter(descriptors).boxed())
    }
}

#[async_trait]
impl ChangeFeedReader for InMemoryChangeFeed {
    async fn read_page(
        &self,
        lease_token: &LeaseToken,
        continuation: Option<&str>,
        options: FeedReadOptions,
    ) -> LeaseResult<FeedPage> {
        let partitions = self.partitions.read();
        let log = partitions
            .get(lease_token)
            .filter(|l| !l.gone)
            .ok_or_else(|| LeaseError::PartitionGone {
                lease_token: lease_token.clone(),
            })?;

        let head = log.base + log.records.len();
        let position = match continuation {
            Some(token) => token.parse::<usize>().map_err(|_| {
                LeaseError::config(format!("invalid continuation token '{}'", token))
            })?,
            None if options.start_from_beginning => log.base,
            None => head,
        };
        let start = position.clamp(log.base, head) - log.base;
        let end = (start + options.max_items.max(1)).min(log.records.len());

        Ok(FeedPage {
            records: log.records[start..end].to_vec(),
            continuation: Some((log.base + end).to_string()),
        })
    }
}
