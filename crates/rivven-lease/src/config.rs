//! Processor configuration
//!
//! Loaded from YAML with environment variable expansion:
//!
//! ```yaml
//! host_name: ${HOSTNAME:-worker-1}
//! lease_prefix: orders-projection
//! lease_renew_interval_ms: 17000
//! lease_expiration_interval_ms: 60000
//! checkpoint:
//!   processed_document_count: 100
//!   time_interval_ms: 60000
//! ```

use crate::error::{LeaseError, LeaseResult};
use crate::feed::FeedReadOptions;
use crate::types::HostId;
use crate::updater::DEFAULT_MAX_UPDATE_ATTEMPTS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// When checkpoints are written
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointFrequency {
    /// Checkpoint after this many documents (0 = no count constraint)
    #[serde(default)]
    pub processed_document_count: usize,

    /// Checkpoint when this much time passed since the last one
    #[serde(default)]
    pub time_interval_ms: Option<u64>,

    /// Observers call `ObserverContext::checkpoint` themselves
    #[serde(default)]
    pub explicit: bool,
}

impl CheckpointFrequency {
    /// Checkpoint after every batch
    pub fn every_batch() -> Self {
        Self::default()
    }

    pub fn with_document_count(mut self, count: usize) -> Self {
        self.processed_document_count = count;
        self
    }

    pub fn with_time_interval(mut self, interval: Duration) -> Self {
        self.time_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Leave checkpointing entirely to the observer
    pub fn explicit() -> Self {
        Self {
            explicit: true,
            ..Self::default()
        }
    }

    pub fn time_interval(&self) -> Option<Duration> {
        self.time_interval_ms.map(Duration::from_millis)
    }

    /// Neither a document count nor a time interval is set
    pub fn is_unconstrained(&self) -> bool {
        self.processed_document_count == 0 && self.time_interval().is_none()
    }

    pub fn validate(&self) -> LeaseResult<()> {
        if self.time_interval_ms == Some(0) {
            return Err(LeaseError::config(
                "checkpoint.time_interval_ms must be greater than zero when set",
            ));
        }
        if self.explicit && (self.processed_document_count > 0 || self.time_interval_ms.is_some())
        {
            return Err(LeaseError::config(
                "checkpoint frequency cannot combine explicit mode with a count or interval",
            ));
        }
        Ok(())
    }
}

/// Configuration of one change feed processor host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Identity of this host in lease documents
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Namespace of the lease documents of this consumer group
    #[serde(default)]
    pub lease_prefix: String,

    /// How often held leases are renewed
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// How often the load balancer looks for leases to take
    #[serde(default = "default_lease_acquire_interval_ms")]
    pub lease_acquire_interval_ms: u64,

    /// A lease not renewed within this window may be taken by another host
    #[serde(default = "default_lease_expiration_interval_ms")]
    pub lease_expiration_interval_ms: u64,

    /// Wait between reads of a partition with no new changes
    #[serde(default = "default_feed_poll_delay_ms")]
    pub feed_poll_delay_ms: u64,

    /// Upper bound on changes per batch
    #[serde(default = "default_max_items_per_page")]
    pub max_items_per_page: usize,

    /// Checkpoint cadence
    #[serde(default)]
    pub checkpoint: CheckpointFrequency,

    /// Conditional writes attempted per lease update before giving up
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,

    /// Lifetime of the bootstrap lock
    #[serde(default = "default_bootstrap_lock_ttl_ms")]
    pub bootstrap_lock_ttl_ms: u64,

    /// Wait before checking again while another host bootstraps
    #[serde(default = "default_bootstrap_retry_delay_ms")]
    pub bootstrap_retry_delay_ms: u64,

    /// Lower bound on partitions per host (0 = none)
    #[serde(default)]
    pub min_partition_count: usize,

    /// Upper bound on partitions per host (0 = none)
    #[serde(default)]
    pub max_partition_count: usize,

    /// Hand back leases above this host's fair share
    #[serde(default)]
    pub release_surplus_leases: bool,

    /// Read new partitions from their beginning rather than from now
    #[serde(default = "default_true")]
    pub start_from_beginning: bool,

    /// Starting position for partitions without a checkpoint
    #[serde(default)]
    pub start_continuation: Option<String>,
}

fn default_host_name() -> String {
    HostId::generate().0
}

fn default_lease_renew_interval_ms() -> u64 {
    17_000
}

fn default_lease_acquire_interval_ms() -> u64 {
    13_000
}

fn default_lease_expiration_interval_ms() -> u64 {
    60_000
}

fn default_feed_poll_delay_ms() -> u64 {
    5_000
}

fn default_max_items_per_page() -> usize {
    100
}

fn default_max_update_attempts() -> u32 {
    DEFAULT_MAX_UPDATE_ATTEMPTS
}

fn default_bootstrap_lock_ttl_ms() -> u64 {
    30_000
}

fn default_bootstrap_retry_delay_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            lease_prefix: String::new(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            lease_acquire_interval_ms: default_lease_acquire_interval_ms(),
            lease_expiration_interval_ms: default_lease_expiration_interval_ms(),
            feed_poll_delay_ms: default_feed_poll_delay_ms(),
            max_items_per_page: default_max_items_per_page(),
            checkpoint: CheckpointFrequency::default(),
            max_update_attempts: default_max_update_attempts(),
            bootstrap_lock_ttl_ms: default_bootstrap_lock_ttl_ms(),
            bootstrap_retry_delay_ms: default_bootstrap_retry_delay_ms(),
            min_partition_count: 0,
            max_partition_count: 0,
            release_surplus_leases: false,
            start_from_beginning: true,
            start_continuation: None,
        }
    }
}

impl ProcessorConfig {
    /// Parse configuration from a YAML string, expanding `${VAR}` and
    /// `${VAR:-default}` references first
    pub fn from_yaml_str(content: &str) -> LeaseResult<Self> {
        let expanded = Self::expand_env_vars(content);
        serde_yaml::from_str(&expanded)
            .map_err(|e| LeaseError::config(format!("invalid processor config: {}", e)))
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> LeaseResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LeaseError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> LeaseResult<()> {
        if self.host_name.trim().is_empty() {
            return Err(LeaseError::config("host_name must not be empty"));
        }
        if self.lease_prefix.contains('.') {
            return Err(LeaseError::config("lease_prefix must not contain '.'"));
        }

        for (name, value) in [
            ("lease_renew_interval_ms", self.lease_renew_interval_ms),
            ("lease_acquire_interval_ms", self.lease_acquire_interval_ms),
            ("lease_expiration_interval_ms", self.lease_expiration_interval_ms),
            ("feed_poll_delay_ms", self.feed_poll_delay_ms),
            ("bootstrap_lock_ttl_ms", self.bootstrap_lock_ttl_ms),
            ("bootstrap_retry_delay_ms", self.bootstrap_retry_delay_ms),
        ] {
            if value == 0 {
                return Err(LeaseError::config(format!("{} must be greater than zero", name)));
            }
        }

        if self.lease_renew_interval_ms >= self.lease_expiration_interval_ms {
            return Err(LeaseError::config(
                "lease_renew_interval_ms must be shorter than lease_expiration_interval_ms",
            ));
        }
        if self.max_items_per_page == 0 {
            return Err(LeaseError::config("max_items_per_page must be greater than zero"));
        }
        if self.max_update_attempts == 0 {
            return Err(LeaseError::config("max_update_attempts must be at least 1"));
        }
        if self.max_partition_count > 0 && self.max_partition_count < self.min_partition_count {
            return Err(LeaseError::config(
                "max_partition_count must not be lower than min_partition_count",
            ));
        }

        self.checkpoint.validate()
    }

    pub fn host_id(&self) -> HostId {
        HostId::new(self.host_name.clone())
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn lease_acquire_interval(&self) -> Duration {
        Duration::from_millis(self.lease_acquire_interval_ms)
    }

    pub fn lease_expiration_interval(&self) -> Duration {
        Duration::from_millis(self.lease_expiration_interval_ms)
    }

    pub fn feed_poll_delay(&self) -> Duration {
        Duration::from_millis(self.feed_poll_delay_ms)
    }

    pub fn bootstrap_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.bootstrap_lock_ttl_ms)
    }

    pub fn bootstrap_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_retry_delay_ms)
    }

    pub fn feed_read_options(&self) -> FeedReadOptions {
        FeedReadOptions {
            max_items: self.max_items_per_page,
            start_from_beginning: self.start_from_beginning,
        }
    }
}
