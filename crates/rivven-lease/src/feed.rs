//! Change feed reading
//!
//! The feed-read protocol itself (how a partition is paged through) is
//! provided by the embedder through [`ChangeFeedReader`]. This module drives
//! that reader for one leased partition and hands every page to the
//! observer chain.

use crate::checkpointer::PartitionCheckpointer;
use crate::error::{LeaseError, LeaseResult};
use crate::health::MonitoredOperation;
use crate::observer::{ChangeFeedObserver, ObserverContext};
use crate::types::LeaseToken;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A single change record delivered to observers
pub type ChangeRecord = serde_json::Value;

/// Options for a single page read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedReadOptions {
    /// Upper bound on records per page
    pub max_items: usize,
    /// Where to start when no continuation exists yet
    pub start_from_beginning: bool,
}

impl Default for FeedReadOptions {
    fn default() -> Self {
        Self {
            max_items: 100,
            start_from_beginning: true,
        }
    }
}

/// One page of changes from a partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    /// Records in feed order
    pub records: Vec<ChangeRecord>,
    /// Position after the last record of this page
    pub continuation: Option<String>,
}

impl FeedPage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reader for the per-partition change stream
#[async_trait]
pub trait ChangeFeedReader: Send + Sync {
    /// Read the next page of `lease_token` after `continuation`.
    ///
    /// Returns [`LeaseError::PartitionGone`](crate::LeaseError::PartitionGone)
    /// when the partition was split or retired.
    async fn read_page(
        &self,
        lease_token: &LeaseToken,
        continuation: Option<&str>,
        options: FeedReadOptions,
    ) -> LeaseResult<FeedPage>;
}

/// Processing loop for one leased partition
pub struct PartitionProcessor {
    lease_token: LeaseToken,
    reader: Arc<dyn ChangeFeedReader>,
    observer: Arc<dyn ChangeFeedObserver>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
    options: FeedReadOptions,
    poll_delay: Duration,
    continuation: Option<String>,
    failed_operation: Option<MonitoredOperation>,
}

impl PartitionProcessor {
    pub fn new(
        lease_token: LeaseToken,
        reader: Arc<dyn ChangeFeedReader>,
        observer: Arc<dyn ChangeFeedObserver>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        options: FeedReadOptions,
        poll_delay: Duration,
        start_continuation: Option<String>,
    ) -> Self {
        Self {
            lease_token,
            reader,
            observer,
            checkpointer,
            options,
            poll_delay,
            continuation: start_continuation,
            failed_operation: None,
        }
    }

    /// Position of the last page handed to the observer
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Operation that ended the last run with an error
    pub fn failed_operation(&self) -> Option<MonitoredOperation> {
        self.failed_operation
    }

    /// Run until `cancel` fires or an error ends the session.
    ///
    /// Cancellation is observed while waiting for a page or for the poll
    /// delay. Observer delivery and the checkpoint it may trigger always run
    /// to completion.
    pub async fn run(&mut self, cancel: CancellationToken) -> LeaseResult<()> {
        debug!(lease_token = %self.lease_token, continuation = ?self.continuation, "Partition processor started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                page = self.reader.read_page(
                    &self.lease_token,
                    self.continuation.as_deref(),
                    self.options,
                ) => page,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    self.failed_operation = Some(MonitoredOperation::ReadFeed);
                    return Err(e);
                }
            };

            if page.is_empty() {
                if page.continuation.is_some() {
                    self.continuation = page.continuation;
                }
                trace!(lease_token = %self.lease_token, "No new changes");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_delay) => {}
                }
                continue;
            }

            let context = ObserverContext::new(
                self.lease_token.clone(),
                page.continuation.clone(),
                self.checkpointer.clone(),
            );

            debug!(
                lease_token = %self.lease_token,
                records = page.records.len(),
                "Dispatching changes to observer"
            );
            if let Err(e) = self.observer.process_changes(&context, page.records).await {
                // observer failures arrive normalised; anything else came
                // from the checkpoint written after the batch
                self.failed_operation = Some(match e {
                    LeaseError::Observer { .. } => MonitoredOperation::ObserverProcess,
                    _ => MonitoredOperation::Checkpoint,
                });
                return Err(e);
            }
            self.continuation = page.continuation;
        }

        debug!(lease_token = %self.lease_token, "Partition processor stopped");
        Ok(())
    }
}
