//! Platform actuators
//!
//! An actuator stops and starts the machines behind a cluster on one
//! platform. The controller is handed an [`ActuatorRegistry`] at construction
//! and asks it for the single actuator that claims each cluster.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, api::ClusterDeployment};

pub mod fake;

pub use fake::FakeActuator;

/// Machine lifecycle operations for one platform.
///
/// Every operation must be idempotent: the controller re-issues stops and
/// starts whenever it observes a cluster that has not finished moving.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HibernationActuator: Send + Sync {
    /// Whether this actuator manages the cluster's machines
    fn can_handle(&self, cluster: &ClusterDeployment) -> bool;

    /// Request that every machine in the cluster stop
    async fn stop_machines(&self, cluster: &ClusterDeployment) -> Result<()>;

    /// Request that every machine in the cluster start
    async fn start_machines(&self, cluster: &ClusterDeployment) -> Result<()>;

    /// True only once all machines are confirmed stopped
    async fn machines_stopped(&self, cluster: &ClusterDeployment) -> Result<bool>;

    /// True only once all machines are running at the platform API level
    async fn machines_running(&self, cluster: &ClusterDeployment) -> Result<bool>;
}

#[derive(Clone, Default)]
pub struct ActuatorRegistry {
    actuators: Vec<Arc<dyn HibernationActuator>>,
}

impl ActuatorRegistry {
    pub fn new(actuators: Vec<Arc<dyn HibernationActuator>>) -> Self {
        Self { actuators }
    }

    /// The actuators this controller ships with
    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(FakeActuator)])
    }

    /// The one actuator that claims `cluster`; none or several is a configuration error.
    pub fn select(&self, cluster: &ClusterDeployment) -> Result<Arc<dyn HibernationActuator>> {
        let mut matching = self.actuators.iter().filter(|a| a.can_handle(cluster));
        match (matching.next(), matching.next()) {
            (Some(actuator), None) => Ok(actuator.clone()),
            (None, _) => Err(Error::Configuration(format!(
                "no hibernation actuator handles platform {}",
                cluster.spec.platform.name()
            ))),
            (Some(_), Some(_)) => Err(Error::Configuration(format!(
                "multiple hibernation actuators handle platform {}",
                cluster.spec.platform.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterDeploymentSpec, Platform};

    fn cluster() -> ClusterDeployment {
        ClusterDeployment::new(
            "test",
            ClusterDeploymentSpec {
                platform: Platform::Gcp {
                    region: "us-central1".to_string(),
                },
                installed: true,
                power_state: None,
                hibernate_after: None,
                cluster_metadata: None,
            },
        )
    }

    fn actuator(claims: bool) -> Arc<dyn HibernationActuator> {
        let mut mock = MockHibernationActuator::new();
        mock.expect_can_handle().return_const(claims);
        Arc::new(mock)
    }

    #[test]
    fn selects_the_single_match() {
        let registry = ActuatorRegistry::new(vec![actuator(false), actuator(true)]);
        assert!(registry.select(&cluster()).is_ok());
    }

    #[test]
    fn no_match_is_fatal() {
        let registry = ActuatorRegistry::new(vec![actuator(false)]);
        let err = registry.select(&cluster()).err().unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("gcp"));
    }

    #[test]
    fn multiple_matches_are_fatal() {
        let registry = ActuatorRegistry::new(vec![actuator(true), actuator(true)]);
        assert!(registry.select(&cluster()).err().unwrap().is_fatal());
    }

    #[test]
    fn builtin_registry_claims_only_fake_clusters() {
        let registry = ActuatorRegistry::builtin();
        let mut cd = cluster();
        assert!(registry.select(&cd).is_err());
        cd.metadata.annotations = Some(
            [(crate::api::FAKE_CLUSTER_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        assert!(registry.select(&cd).is_ok());
    }
}
