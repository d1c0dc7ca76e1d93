//! Lease load balancing
//!
//! Every host periodically looks at the full lease set and decides which
//! leases to take. The default strategy aims for an even spread: each host
//! targets `ceil(partitions / hosts)` leases, takes expired or unowned
//! leases first, and otherwise steals one lease per pass from the most
//! loaded host. Hosts are only known through the leases they hold.

use crate::controller::PartitionController;
use crate::error::LeaseResult;
use crate::health::{HealthMonitor, HealthMonitoringRecord, MonitoredOperation};
use crate::lease::Lease;
use crate::lease_manager::LeaseManager;
use crate::types::HostId;
use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides which leases this host should take or hand back
pub trait LoadBalancingStrategy: Send + Sync {
    /// Leases to acquire, given every lease of the consumer group
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;

    /// Owned leases to release voluntarily
    fn select_leases_to_release(&self, _all_leases: &[Lease]) -> Vec<Lease> {
        Vec::new()
    }
}

/// Spreads partitions evenly across the hosts holding leases
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host: HostId,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration: Duration,
    release_surplus: bool,
}

struct LeaseCensus<'a> {
    /// Live lease count per owner, including this host
    per_host: HashMap<&'a HostId, usize>,
    expired: Vec<&'a Lease>,
    total: usize,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(host: HostId, lease_expiration: Duration) -> Self {
        Self {
            host,
            min_partition_count: 0,
            max_partition_count: 0,
            lease_expiration,
            release_surplus: false,
        }
    }

    /// Bound the number of partitions per host (0 = unbounded)
    pub fn with_partition_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_partition_count = min;
        self.max_partition_count = max;
        self
    }

    pub fn with_surplus_release(mut self, enabled: bool) -> Self {
        self.release_surplus = enabled;
        self
    }

    fn census<'a>(&'a self, all_leases: &'a [Lease]) -> LeaseCensus<'a> {
        let now = Utc::now();
        let mut per_host: HashMap<&HostId, usize> = HashMap::new();
        per_host.insert(&self.host, 0);
        let mut expired = Vec::new();

        for lease in all_leases {
            match &lease.owner {
                Some(owner) if !lease.is_expired(self.lease_expiration, now) => {
                    *per_host.entry(owner).or_default() += 1;
                }
                _ => expired.push(lease),
            }
        }

        LeaseCensus {
            per_host,
            expired,
            total: all_leases.len(),
        }
    }

    /// Fair share of a host given the partition and host counts
    pub fn target_partition_count(&self, partitions: usize, hosts: usize) -> usize {
        let mut target = 1;
        if hosts > 0 && partitions > hosts {
            target = partitions.div_ceil(hosts);
        }
        if self.max_partition_count > 0 && target > self.max_partition_count {
            target = self.max_partition_count;
        }
        if self.min_partition_count > 0 && target < self.min_partition_count {
            target = self.min_partition_count;
        }
        target
    }
}

impl LoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        let census = self.census(all_leases);
        let target = self.target_partition_count(census.total, census.per_host.len());
        let mine = census.per_host.get(&self.host).copied().unwrap_or(0);
        if mine >= target {
            return Vec::new();
        }
        let needed = target - mine;

        if !census.expired.is_empty() {
            let mut expired = census.expired;
            expired.shuffle(&mut rand::thread_rng());
            return expired.into_iter().take(needed).cloned().collect();
        }

        // steal one lease from the most loaded host if it is above its share
        let busiest = census
            .per_host
            .iter()
            .filter(|(host, _)| **host != &self.host)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)));
        let threshold = target - usize::from(needed > 1);
        match busiest {
            Some((host, count)) if *count > threshold => all_leases
                .iter()
                .find(|lease| lease.owner.as_ref() == Some(*host))
                .cloned()
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn select_leases_to_release(&self, all_leases: &[Lease]) -> Vec<Lease> {
        if !self.release_surplus {
            return Vec::new();
        }
        let census = self.census(all_leases);
        let target = self.target_partition_count(census.total, census.per_host.len());
        let mine = census.per_host.get(&self.host).copied().unwrap_or(0);
        if mine <= target {
            return Vec::new();
        }

        // one per pass, so other hosts get a chance to react
        all_leases
            .iter()
            .find(|lease| lease.is_owned_by(&self.host))
            .cloned()
            .into_iter()
            .collect()
    }
}

/// Periodic balancing loop of one host
pub struct PartitionLoadBalancer {
    controller: Arc<PartitionController>,
    manager: Arc<dyn LeaseManager>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    health: Arc<dyn HealthMonitor>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: Arc<PartitionController>,
        manager: Arc<dyn LeaseManager>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        health: Arc<dyn HealthMonitor>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            manager,
            strategy,
            health,
            interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Run one balancing pass
    pub async fn balance_once(&self) -> LeaseResult<()> {
        let leases = self.manager.list_all_leases().await?;

        let to_take = self.strategy.select_leases_to_take(&leases);
        if !to_take.is_empty() {
            debug!(
                host = %self.manager.host(),
                leases = to_take.len(),
                "Taking leases"
            );
        }
        for lease in to_take {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.controller.add_or_update_lease(lease).await {
                Ok(()) => {}
                Err(e) if e.is_lease_lost() || e.is_shutdown() => {}
                Err(e) => debug!(error = %e, "Lease acquisition skipped"),
            }
        }

        for lease in self.strategy.select_leases_to_release(&leases) {
            info!(lease_token = %lease.lease_token, "Releasing surplus lease");
            self.controller.stop_partition(&lease.lease_token);
        }
        Ok(())
    }

    /// Start the balancing loop in the background
    pub fn start(self: &Arc<Self>) {
        let balancer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(host = %balancer.manager.host(), interval = ?balancer.interval, "Load balancer started");
            loop {
                if let Err(e) = balancer.balance_once().await {
                    warn!(error = %e, "Load balancing pass failed");
                    balancer
                        .health
                        .inspect(HealthMonitoringRecord::error(
                            MonitoredOperation::LoadBalance,
                            None,
                            &e,
                        ))
                        .await;
                }

                tokio::select! {
                    biased;
                    _ = balancer.cancel.cancelled() => break,
                    _ = tokio::time::sleep(balancer.interval) => {}
                }
            }
            info!(host = %balancer.manager.host(), "Load balancer stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the loop and every partition it started
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Load balancer task panicked");
            }
        }
        self.controller.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LeaseToken;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const EXPIRY: Duration = Duration::from_secs(60);

    fn lease(token: usize, owner: Option<&str>) -> Lease {
        let mut lease = Lease::new("group", LeaseToken::new(token.to_string()), None);
        lease.owner = owner.map(HostId::new);
        lease
    }

    fn strategy(host: &str) -> EqualPartitionsBalancingStrategy {
        EqualPartitionsBalancingStrategy::new(HostId::new(host), EXPIRY)
    }

    fn counts(leases: &[Lease]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for lease in leases {
            if let Some(owner) = &lease.owner {
                *counts.entry(owner.0.clone()).or_default() += 1;
            }
        }
        counts
    }

    /// Let every host take what its strategy selects until nothing changes
    fn converge(leases: &mut [Lease], hosts: &[String]) -> bool {
        for _ in 0..(leases.len() * hosts.len() * 4 + 4) {
            let mut changed = false;
            for host in hosts {
                let selected = strategy(host).select_leases_to_take(leases);
                for pick in selected {
                    if let Some(lease) = leases.iter_mut().find(|l| l.lease_token == pick.lease_token) {
                        lease.owner = Some(HostId::new(host.clone()));
                        lease.timestamp = Utc::now();
                        changed = true;
                    }
                }
            }
            if !changed {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_target_partition_count() {
        let s = strategy("a");
        assert_eq!(s.target_partition_count(4, 2), 2);
        assert_eq!(s.target_partition_count(5, 2), 3);
        assert_eq!(s.target_partition_count(2, 4), 1);
        assert_eq!(s.target_partition_count(0, 1), 1);

        let bounded = strategy("a").with_partition_bounds(2, 3);
        assert_eq!(bounded.target_partition_count(10, 2), 3);
        assert_eq!(bounded.target_partition_count(2, 4), 2);
    }

    #[test]
    fn test_lone_host_takes_everything_unowned() {
        let leases: Vec<Lease> = (0..4).map(|i| lease(i, None)).collect();
        assert_eq!(strategy("a").select_leases_to_take(&leases).len(), 4);
    }

    #[test]
    fn test_expired_leases_are_taken_before_stealing() {
        let mut stale = lease(0, Some("dead"));
        stale.timestamp = Utc::now() - chrono::Duration::seconds(120);
        let leases = vec![stale, lease(1, Some("b")), lease(2, Some("b")), lease(3, Some("b"))];

        let taken = strategy("a").select_leases_to_take(&leases);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].lease_token, LeaseToken::new("0"));
    }

    #[test]
    fn test_steals_one_from_busiest_host() {
        let leases: Vec<Lease> = (0..4).map(|i| lease(i, Some("b"))).collect();

        let taken = strategy("a").select_leases_to_take(&leases);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].owner, Some(HostId::new("b")));
    }

    #[test]
    fn test_balanced_fleet_takes_nothing() {
        let leases = vec![
            lease(0, Some("a")),
            lease(1, Some("a")),
            lease(2, Some("b")),
            lease(3, Some("b")),
            lease(4, Some("b")),
        ];
        assert!(strategy("a").select_leases_to_take(&leases).is_empty());
        assert!(strategy("b").select_leases_to_take(&leases).is_empty());
    }

    #[test]
    fn test_surplus_release() {
        let leases: Vec<Lease> = (0..4).map(|i| lease(i, Some("a"))).collect();

        let capped = strategy("a").with_partition_bounds(0, 2);
        assert!(capped.select_leases_to_release(&leases).is_empty());

        let releasing = capped.with_surplus_release(true);
        let released = releasing.select_leases_to_release(&leases);
        assert_eq!(released.len(), 1);
        assert!(released[0].is_owned_by(&HostId::new("a")));
    }

    #[test]
    fn test_four_partitions_two_hosts_converge() {
        let mut leases: Vec<Lease> = (0..4).map(|i| lease(i, None)).collect();
        let hosts = vec!["a".to_string(), "b".to_string()];

        assert!(converge(&mut leases, &hosts));
        let counts = counts(&leases);
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// After convergence every lease has one owner and shares differ by at most one
        #[test]
        fn test_convergence_is_even(partitions in 1usize..24, host_count in 1usize..6) {
            let mut leases: Vec<Lease> = (0..partitions).map(|i| lease(i, None)).collect();
            let hosts: Vec<String> = (0..host_count).map(|i| format!("host-{}", i)).collect();

            prop_assert!(converge(&mut leases, &hosts));
            prop_assert!(leases.iter().all(|l| l.owner.is_some()));

            let counts = counts(&leases);
            let max = counts.values().copied().max().unwrap_or(0);
            let min = if counts.len() < host_count.min(partitions) {
                0
            } else {
                counts.values().copied().min().unwrap_or(0)
            };
            prop_assert!(max - min <= 1, "uneven spread: {:?}", counts);
        }
    }
}
