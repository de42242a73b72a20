use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, PostParams},
};
use serde_json::json;

use crate::{
    Error, Result,
    api::{ClusterDeployment, ClusterSync},
};

/// Hub-side reads and writes of the objects the controller owns.
///
/// Writes carry the object's `resourceVersion`, so a stale copy fails with a
/// conflict instead of overwriting a newer one.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterDeployment>>;

    async fn get_sync(&self, namespace: &str, name: &str) -> Result<Option<ClusterSync>>;

    /// Replace the spec (desired power state)
    async fn update_cluster(&self, cluster: &ClusterDeployment) -> Result<ClusterDeployment>;

    /// Write the status (conditions)
    async fn update_cluster_status(&self, cluster: &ClusterDeployment)
    -> Result<ClusterDeployment>;
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, namespace: &str) -> Api<ClusterDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn key(cluster: &ClusterDeployment) -> Result<(&str, &str)> {
    let namespace = cluster.metadata.namespace.as_deref().ok_or(Error::MissingField)?;
    let name = cluster.metadata.name.as_deref().ok_or(Error::MissingField)?;
    Ok((namespace, name))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterDeployment>> {
        Ok(self.clusters(namespace).get_opt(name).await?)
    }

    async fn get_sync(&self, namespace: &str, name: &str) -> Result<Option<ClusterSync>> {
        Ok(Api::<ClusterSync>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    async fn update_cluster(&self, cluster: &ClusterDeployment) -> Result<ClusterDeployment> {
        let (namespace, name) = key(cluster)?;
        Ok(self
            .clusters(namespace)
            .replace(name, &PostParams::default(), cluster)
            .await?)
    }

    async fn update_cluster_status(
        &self,
        cluster: &ClusterDeployment,
    ) -> Result<ClusterDeployment> {
        let (namespace, name) = key(cluster)?;
        // resourceVersion in a merge patch makes the write conditional
        let patch = json!({
            "metadata": { "resourceVersion": cluster.metadata.resource_version },
            "status": cluster.status,
        });
        Ok(self
            .clusters(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
