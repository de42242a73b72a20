//! Clients for the managed clusters' own API servers

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    certificates::v1::CertificateSigningRequest,
    core::v1::{Node, Secret},
};
use kube::{
    Api, Client, Config,
    api::{ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::ClusterDeployment,
    conditions::UNREACHABLE_CONDITION,
};

/// Key holding the kubeconfig in the admin kubeconfig secret
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// The slice of a remote cluster's API the controller uses
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>>;

    /// Write `csr`'s conditions through the approval subresource
    async fn update_approval(&self, csr: &CertificateSigningRequest) -> Result<()>;
}

#[async_trait]
pub trait RemoteClientBuilder: Send + Sync {
    /// Connect to the cluster's API server.
    ///
    /// Returns [`Error::Unreachable`] when the cluster is known to be
    /// unreachable; callers requeue rather than fail on it.
    async fn build(&self, cluster: &ClusterDeployment) -> Result<Arc<dyn RemoteClient>>;
}

pub struct KubeRemoteClient {
    client: Client,
}

impl KubeRemoteClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteClient for KubeRemoteClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(nodes.items)
    }

    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>> {
        let csrs = Api::<CertificateSigningRequest>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(csrs.items)
    }

    async fn update_approval(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let name = csr.metadata.name.as_deref().ok_or(Error::MissingField)?;
        Api::<CertificateSigningRequest>::all(self.client.clone())
            .replace_subresource(
                "approval",
                name,
                &PostParams::default(),
                serde_json::to_vec(csr)?,
            )
            .await?;
        Ok(())
    }
}

/// Fails with [`Error::Unreachable`] while the cluster's `Unreachable`
/// condition is True.
pub fn ensure_reachable(cluster: &ClusterDeployment) -> Result<()> {
    let unreachable = cluster
        .status
        .as_ref()
        .and_then(|s| s.conditions.get(UNREACHABLE_CONDITION))
        .filter(|c| c.is_true());
    match unreachable {
        Some(condition) => Err(Error::Unreachable(condition.message.clone())),
        None => Ok(()),
    }
}

pub fn kubeconfig_secret_name(cluster: &ClusterDeployment) -> Result<&str> {
    cluster
        .spec
        .cluster_metadata
        .as_ref()
        .map(|m| m.admin_kubeconfig_secret_ref.name.as_str())
        .ok_or_else(|| {
            Error::Configuration("cluster has no admin kubeconfig secret reference".to_string())
        })
}

pub fn kubeconfig_yaml(secret: &Secret) -> Result<&str> {
    let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "secret {secret_name} has no {KUBECONFIG_SECRET_KEY} key"
            ))
        })?;
    std::str::from_utf8(&raw.0).map_err(|e| {
        Error::Configuration(format!("secret {secret_name} is not valid UTF-8: {e}"))
    })
}

/// Builds remote clients from the admin kubeconfig secret stored beside the
/// cluster deployment on the hub.
pub struct KubeconfigSecretBuilder {
    hub: Client,
}

impl KubeconfigSecretBuilder {
    pub fn new(hub: Client) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl RemoteClientBuilder for KubeconfigSecretBuilder {
    #[instrument(level = Level::DEBUG, skip_all)]
    async fn build(&self, cluster: &ClusterDeployment) -> Result<Arc<dyn RemoteClient>> {
        ensure_reachable(cluster)?;

        let namespace = cluster.metadata.namespace.as_deref().ok_or(Error::MissingField)?;
        let secret_name = kubeconfig_secret_name(cluster)?;
        let secret = Api::<Secret>::namespaced(self.hub.clone(), namespace)
            .get(secret_name)
            .await?;

        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml(&secret)?)?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;

        Ok(Arc::new(KubeRemoteClient::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::{
        api::{
            ClusterDeploymentSpec, ClusterDeploymentStatus, ClusterMetadata, Platform,
            SecretReference,
        },
        conditions::ConditionStatus,
    };

    fn cluster(metadata: Option<ClusterMetadata>) -> ClusterDeployment {
        let mut cd = ClusterDeployment::new(
            "test",
            ClusterDeploymentSpec {
                platform: Platform::Aws {
                    region: "us-east-1".to_string(),
                },
                installed: true,
                power_state: None,
                hibernate_after: None,
                cluster_metadata: metadata,
            },
        );
        cd.status = Some(ClusterDeploymentStatus::default());
        cd
    }

    fn metadata() -> ClusterMetadata {
        ClusterMetadata {
            infra_id: "test-abc12".to_string(),
            admin_kubeconfig_secret_ref: SecretReference {
                name: "test-admin-kubeconfig".to_string(),
            },
        }
    }

    fn secret(key: &str, value: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("test-admin-kubeconfig".to_string()),
                ..Default::default()
            },
            data: Some([(key.to_string(), ByteString(value.to_vec()))].into()),
            ..Default::default()
        }
    }

    #[test]
    fn unreachable_condition_blocks_connecting() {
        let now = chrono::Utc::now();
        let mut cd = cluster(Some(metadata()));
        assert!(ensure_reachable(&cd).is_ok());

        cd.conditions_mut()
            .set(UNREACHABLE_CONDITION, ConditionStatus::False, "Reachable", "", now);
        assert!(ensure_reachable(&cd).is_ok());

        cd.conditions_mut().set(
            UNREACHABLE_CONDITION,
            ConditionStatus::True,
            "Timeout",
            "dial tcp: i/o timeout",
            now,
        );
        match ensure_reachable(&cd) {
            Err(Error::Unreachable(message)) => assert_eq!(message, "dial tcp: i/o timeout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn secret_reference_comes_from_cluster_metadata() {
        assert_eq!(
            kubeconfig_secret_name(&cluster(Some(metadata()))).unwrap(),
            "test-admin-kubeconfig"
        );
        assert!(kubeconfig_secret_name(&cluster(None)).unwrap_err().is_fatal());
    }

    #[test]
    fn kubeconfig_read_from_secret_key() {
        let valid = secret(KUBECONFIG_SECRET_KEY, b"apiVersion: v1");
        let yaml = kubeconfig_yaml(&valid).unwrap();
        assert_eq!(yaml, "apiVersion: v1");

        let err = kubeconfig_yaml(&secret("config", b"apiVersion: v1")).unwrap_err();
        assert!(err.is_fatal());
        assert!(kubeconfig_yaml(&secret(KUBECONFIG_SECRET_KEY, &[0xff, 0xfe])).is_err());
    }
}
