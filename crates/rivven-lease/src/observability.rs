//! Lease metrics
//!
//! Counters are recorded through the `metrics` crate facade when the
//! `metrics` feature is enabled and compile to nothing otherwise. Install any
//! `metrics` recorder (for example a Prometheus exporter) to collect them.
//!
//! All metrics follow the pattern `rivven_lease_{name}_total`.

/// Lease lifecycle counters
pub struct LeaseMetrics;

impl LeaseMetrics {
    /// Leases acquired by this host
    pub fn increment_acquisitions() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_acquisitions_total").increment(1);
    }

    /// Successful renewals
    pub fn increment_renewals() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_renewals_total").increment(1);
    }

    /// Leases released by this host
    pub fn increment_releases() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_releases_total").increment(1);
    }

    /// Successful checkpoints
    pub fn increment_checkpoints() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_checkpoints_total").increment(1);
    }

    /// Leases lost to other hosts or deleted
    pub fn increment_leases_lost() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_lost_total").increment(1);
    }

    /// Conditional writes retried after a version conflict
    pub fn increment_conflict_retries() {
        #[cfg(feature = "metrics")]
        metrics::counter!("rivven_lease_conflict_retries_total").increment(1);
    }

    /// Number of partitions currently processed by this host
    pub fn set_owned_partitions(_count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("rivven_lease_owned_partitions").set(_count as f64);
    }
}
