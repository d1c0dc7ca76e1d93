//! Turns observer failures and panics into health records

use super::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverDecorator};
use crate::error::{LeaseError, LeaseResult};
use crate::feed::ChangeRecord;
use crate::health::{HealthMonitor, HealthMonitoringRecord, MonitoredOperation};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Observer wrapper that reports failures of the wrapped observer.
///
/// A panic inside the wrapped observer is caught and surfaces as
/// [`LeaseError::Observer`] so the partition closes cleanly instead of
/// taking its task down. Lease-lost errors raised by explicit checkpoints
/// pass through unchanged.
pub struct ErrorReportingObserver {
    inner: Arc<dyn ChangeFeedObserver>,
    monitor: Arc<dyn HealthMonitor>,
}

impl ErrorReportingObserver {
    pub fn new(inner: Arc<dyn ChangeFeedObserver>, monitor: Arc<dyn HealthMonitor>) -> Self {
        Self { inner, monitor }
    }

    async fn report(
        &self,
        operation: MonitoredOperation,
        context: &ObserverContext,
        err: LeaseError,
    ) -> LeaseError {
        self.monitor
            .inspect(HealthMonitoringRecord::error(
                operation,
                Some(context.lease_token()),
                &err,
            ))
            .await;

        if err.is_lease_lost() || matches!(err, LeaseError::Observer { .. }) {
            err
        } else {
            LeaseError::observer(context.lease_token(), err.to_string())
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("observer panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("observer panicked: {}", msg)
    } else {
        "observer panicked".to_string()
    }
}

#[async_trait]
impl ChangeFeedObserver for ErrorReportingObserver {
    async fn open(&self, context: &ObserverContext) -> LeaseResult<()> {
        let result = match AssertUnwindSafe(self.inner.open(context)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(LeaseError::observer(
                context.lease_token(),
                panic_message(payload),
            )),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report(MonitoredOperation::ObserverOpen, context, err).await),
        }
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) {
        if let Err(payload) = AssertUnwindSafe(self.inner.close(context, reason))
            .catch_unwind()
            .await
        {
            let message = panic_message(payload);
            warn!(lease_token = %context.lease_token(), %reason, "{}", message);
            self.monitor
                .inspect(HealthMonitoringRecord::error(
                    MonitoredOperation::ObserverClose,
                    Some(context.lease_token()),
                    message,
                ))
                .await;
        }
    }

    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<ChangeRecord>,
    ) -> LeaseResult<()> {
        let result = match AssertUnwindSafe(self.inner.process_changes(context, changes))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(LeaseError::observer(
                context.lease_token(),
                panic_message(payload),
            )),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report(MonitoredOperation::ObserverProcess, context, err).await),
        }
    }
}

/// Decorator reporting observer failures to `monitor`
pub fn error_reporting(monitor: Arc<dyn HealthMonitor>) -> ObserverDecorator {
    Arc::new(move |observer: Arc<dyn ChangeFeedObserver>| {
        Arc::new(ErrorReportingObserver::new(observer, monitor.clone())) as Arc<dyn ChangeFeedObserver>
    })
}
