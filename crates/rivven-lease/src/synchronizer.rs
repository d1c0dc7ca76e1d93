//! Keeps the lease set in line with the partition set of the feed

use crate::error::{LeaseError, LeaseResult};
use crate::lease::Lease;
use crate::lease_manager::LeaseManager;
use crate::store::{PartitionDescriptor, PartitionSource};
use crate::types::LeaseToken;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Creates leases for new partitions and replaces leases of split partitions
pub struct PartitionSynchronizer {
    source: Arc<dyn PartitionSource>,
    manager: Arc<dyn LeaseManager>,
}

impl PartitionSynchronizer {
    pub fn new(source: Arc<dyn PartitionSource>, manager: Arc<dyn LeaseManager>) -> Self {
        Self { source, manager }
    }

    async fn partitions(&self) -> LeaseResult<Vec<PartitionDescriptor>> {
        self.source
            .enumerate_partitions()
            .await
            .map_err(|e| LeaseError::StoreUnavailable(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| LeaseError::StoreUnavailable(e.to_string()))
    }

    /// Create a lease for every partition that has none.
    ///
    /// A partition created by a split starts from its parent's continuation
    /// when the parent lease is still around. Returns the number of leases
    /// this call created.
    pub async fn create_missing_leases(&self) -> LeaseResult<usize> {
        let partitions = self.partitions().await?;
        let existing: HashMap<LeaseToken, Lease> = self
            .manager
            .list_all_leases()
            .await?
            .into_iter()
            .map(|lease| (lease.lease_token.clone(), lease))
            .collect();

        let mut created = 0;
        for partition in partitions {
            if existing.contains_key(&partition.lease_token) {
                continue;
            }
            let continuation = partition
                .parents
                .iter()
                .find_map(|parent| existing.get(parent))
                .and_then(|parent| parent.continuation_token.clone());

            if self
                .manager
                .create_lease_if_not_exists(&partition.lease_token, continuation)
                .await?
                .is_some()
            {
                created += 1;
            }
        }

        if created > 0 {
            info!(created, "Created leases for new partitions");
        }
        Ok(created)
    }

    /// Replace the lease of a partition that is gone by leases for its
    /// children, then delete it.
    ///
    /// The children inherit the continuation of `lease` and are left
    /// unowned for the load balancer to pick up. A partition that was
    /// retired without successors only has its lease deleted.
    pub async fn split_partition(&self, lease: &Lease) -> LeaseResult<Vec<LeaseToken>> {
        let children: Vec<LeaseToken> = self
            .partitions()
            .await?
            .into_iter()
            .filter(|partition| partition.parents.contains(&lease.lease_token))
            .map(|partition| partition.lease_token)
            .collect();

        for child in &children {
            self.manager
                .create_lease_if_not_exists(child, lease.continuation_token.clone())
                .await?;
        }
        self.manager.delete(lease).await?;

        info!(
            lease_token = %lease.lease_token,
            children = ?children,
            continuation = ?lease.continuation_token,
            "Replaced lease of retired partition"
        );
        Ok(children)
    }
}
