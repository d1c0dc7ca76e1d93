//! Top-level lifecycle of one host
//!
//! Start order is strict: bootstrap, then controller initialization, then
//! the load balancer. The controller must have registered every partition
//! before the balancer starts acquiring leases.

use crate::balancer::PartitionLoadBalancer;
use crate::bootstrap::Bootstrapper;
use crate::controller::PartitionController;
use crate::error::LeaseResult;
use crate::health::{HealthMonitor, HealthMonitoringRecord, MonitoredOperation};
use std::sync::Arc;
use tracing::info;

/// Sequences bootstrap, controller and load balancer
pub struct PartitionManager {
    bootstrapper: Bootstrapper,
    controller: Arc<PartitionController>,
    balancer: Arc<PartitionLoadBalancer>,
    health: Arc<dyn HealthMonitor>,
}

impl PartitionManager {
    pub fn new(
        bootstrapper: Bootstrapper,
        controller: Arc<PartitionController>,
        balancer: Arc<PartitionLoadBalancer>,
        health: Arc<dyn HealthMonitor>,
    ) -> Self {
        Self {
            bootstrapper,
            controller,
            balancer,
            health,
        }
    }

    pub fn controller(&self) -> &Arc<PartitionController> {
        &self.controller
    }

    pub async fn start(&self) -> LeaseResult<()> {
        if let Err(e) = self.bootstrapper.initialize().await {
            self.health
                .inspect(HealthMonitoringRecord::error(
                    MonitoredOperation::Bootstrap,
                    None,
                    &e,
                ))
                .await;
            return Err(e);
        }
        self.controller.initialize().await?;
        self.balancer.start();
        info!(host = %self.controller.host(), "Partition manager started");
        Ok(())
    }

    /// Stop the balancer and every partition of this host
    pub async fn stop(&self) {
        self.balancer.stop().await;
        info!(host = %self.controller.host(), "Partition manager stopped");
    }
}
