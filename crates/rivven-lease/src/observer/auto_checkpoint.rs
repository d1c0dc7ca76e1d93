//! Automatic checkpointing on a document-count / time cadence

use super::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverDecorator};
use crate::config::CheckpointFrequency;
use crate::error::LeaseResult;
use crate::feed::ChangeRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Cadence {
    processed: usize,
    last_checkpoint: Instant,
}

/// Checkpoints after delivered batches according to a [`CheckpointFrequency`]
pub struct AutoCheckpointer {
    inner: Arc<dyn ChangeFeedObserver>,
    frequency: CheckpointFrequency,
    cadence: Mutex<Cadence>,
}

impl AutoCheckpointer {
    pub fn new(inner: Arc<dyn ChangeFeedObserver>, frequency: CheckpointFrequency) -> Self {
        Self {
            inner,
            frequency,
            cadence: Mutex::new(Cadence {
                processed: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    /// Count `delivered` documents and decide whether a checkpoint is due
    fn is_due(&self, delivered: usize) -> bool {
        if self.frequency.is_unconstrained() {
            return true;
        }

        let mut cadence = self.cadence.lock();
        cadence.processed += delivered;

        let count_reached = self.frequency.processed_document_count > 0
            && cadence.processed >= self.frequency.processed_document_count;
        let interval_reached = self
            .frequency
            .time_interval()
            .is_some_and(|interval| cadence.last_checkpoint.elapsed() >= interval);

        count_reached || interval_reached
    }

    fn reset(&self) {
        let mut cadence = self.cadence.lock();
        cadence.processed = 0;
        cadence.last_checkpoint = Instant::now();
    }
}

#[async_trait]
impl ChangeFeedObserver for AutoCheckpointer {
    async fn open(&self, context: &ObserverContext) -> LeaseResult<()> {
        self.reset();
        self.inner.open(context).await
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) {
        self.inner.close(context, reason).await
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<ChangeRecord>,
    ) -> LeaseResult<()> {
        let delivered = changes.len();
        self.inner.process_changes(context, changes).await?;

        if self.is_due(delivered) {
            context.checkpoint().await?;
            self.reset();
            trace!(
                lease_token = %context.lease_token(),
                continuation = ?context.continuation(),
                "Automatic checkpoint"
            );
        }
        Ok(())
    }
}

/// Decorator adding automatic checkpoints; the identity in explicit mode
pub fn checkpointing(frequency: CheckpointFrequency) -> ObserverDecorator {
    Arc::new(move |observer: Arc<dyn ChangeFeedObserver>| {
        if frequency.explicit {
            observer
        } else {
            Arc::new(AutoCheckpointer::new(observer, frequency.clone())) as Arc<dyn ChangeFeedObserver>
        }
    })
}
