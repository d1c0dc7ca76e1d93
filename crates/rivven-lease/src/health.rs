//! # Health Monitoring
//!
//! Sink for operational health events raised while managing leases:
//! failed acquisitions, lost leases, checkpoint failures and observer
//! errors. A monitor never feeds back into control flow.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rivven_lease::health::{HealthMonitor, TracingHealthMonitor};
//!
//! let monitor: Arc<dyn HealthMonitor> = Arc::new(TracingHealthMonitor);
//! ```

use crate::types::LeaseToken;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, error};

/// Severity of a health record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthSeverity {
    Informational,
    Error,
}

impl fmt::Display for HealthSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Informational => write!(f, "informational"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Operation during which a record was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredOperation {
    Bootstrap,
    AcquireLease,
    RenewLease,
    ReleaseLease,
    Checkpoint,
    ReadFeed,
    ObserverOpen,
    ObserverProcess,
    ObserverClose,
    LoadBalance,
}

impl fmt::Display for MonitoredOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bootstrap => "bootstrap",
            Self::AcquireLease => "acquire_lease",
            Self::RenewLease => "renew_lease",
            Self::ReleaseLease => "release_lease",
            Self::Checkpoint => "checkpoint",
            Self::ReadFeed => "read_feed",
            Self::ObserverOpen => "observer_open",
            Self::ObserverProcess => "observer_process",
            Self::ObserverClose => "observer_close",
            Self::LoadBalance => "load_balance",
        };
        f.write_str(name)
    }
}

/// A single health event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitoringRecord {
    pub severity: HealthSeverity,
    pub operation: MonitoredOperation,
    pub lease_token: Option<LeaseToken>,
    pub cause: Option<String>,
}

impl HealthMonitoringRecord {
    pub fn error(
        operation: MonitoredOperation,
        lease_token: Option<&LeaseToken>,
        cause: impl fmt::Display,
    ) -> Self {
        Self {
            severity: HealthSeverity::Error,
            operation,
            lease_token: lease_token.cloned(),
            cause: Some(cause.to_string()),
        }
    }

    pub fn informational(operation: MonitoredOperation, lease_token: Option<&LeaseToken>) -> Self {
        Self {
            severity: HealthSeverity::Informational,
            operation,
            lease_token: lease_token.cloned(),
            cause: None,
        }
    }
}

/// Health event sink
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn inspect(&self, record: HealthMonitoringRecord);
}

/// Logs every record through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHealthMonitor;

#[async_trait]
impl HealthMonitor for TracingHealthMonitor {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        let lease_token = record
            .lease_token
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or("-");
        match record.severity {
            HealthSeverity::Error => error!(
                operation = %record.operation,
                lease_token,
                cause = record.cause.as_deref().unwrap_or("unknown"),
                "Lease health error"
            ),
            HealthSeverity::Informational => debug!(
                operation = %record.operation,
                lease_token,
                "Lease health event"
            ),
        }
    }
}

/// Keeps every record in memory; useful for embedders' tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingHealthMonitor {
    records: Mutex<Vec<HealthMonitoringRecord>>,
}

impl RecordingHealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HealthMonitoringRecord> {
        self.records.lock().clone()
    }

    pub fn errors(&self) -> Vec<HealthMonitoringRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.severity == HealthSeverity::Error)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HealthMonitor for RecordingHealthMonitor {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_monitor_filters_errors() {
        let monitor = RecordingHealthMonitor::new();
        let token = LeaseToken::new("4");

        monitor
            .inspect(HealthMonitoringRecord::informational(
                MonitoredOperation::AcquireLease,
                Some(&token),
            ))
            .await;
        monitor
            .inspect(HealthMonitoringRecord::error(
                MonitoredOperation::Checkpoint,
                Some(&token),
                "lease lost",
            ))
            .await;

        assert_eq!(monitor.records().len(), 2);
        let errors = monitor.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].operation, MonitoredOperation::Checkpoint);
        assert_eq!(errors[0].cause.as_deref(), Some("lease lost"));
    }

    #[tokio::test]
    async fn test_tracing_monitor_accepts_all_severities() {
        let monitor = TracingHealthMonitor;
        monitor
            .inspect(HealthMonitoringRecord::error(
                MonitoredOperation::RenewLease,
                None,
                "boom",
            ))
            .await;
        monitor
            .inspect(HealthMonitoringRecord::informational(
                MonitoredOperation::Bootstrap,
                None,
            ))
            .await;
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(MonitoredOperation::ObserverProcess.to_string(), "observer_process");
        assert_eq!(HealthSeverity::Error.to_string(), "error");
    }
}
