use async_trait::async_trait;
use tracing::{Level, instrument};

use super::HibernationActuator;
use crate::{Result, api::ClusterDeployment};

/// Actuator for fake clusters: there are no machines, so every request
/// succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeActuator;

#[async_trait]
impl HibernationActuator for FakeActuator {
    fn can_handle(&self, cluster: &ClusterDeployment) -> bool {
        cluster.is_fake()
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    async fn stop_machines(&self, _cluster: &ClusterDeployment) -> Result<()> {
        tracing::debug!("fake cluster, nothing to stop");
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    async fn start_machines(&self, _cluster: &ClusterDeployment) -> Result<()> {
        tracing::debug!("fake cluster, nothing to start");
        Ok(())
    }

    async fn machines_stopped(&self, _cluster: &ClusterDeployment) -> Result<bool> {
        Ok(true)
    }

    async fn machines_running(&self, _cluster: &ClusterDeployment) -> Result<bool> {
        Ok(true)
    }
}
