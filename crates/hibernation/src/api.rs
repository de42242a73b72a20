use std::time::Duration;

use chrono::{DateTime, Utc};
use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{ClusterCondition, Conditions, HIBERNATING_CONDITION};

/// Annotation marking a cluster as fake: no real machines back it.
pub const FAKE_CLUSTER_ANNOTATION: &str = "lifecycle.dev/fake-cluster";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "lifecycle.dev",
    version = "v1",
    kind = "ClusterDeployment",
    namespaced
)]
#[kube(status = "ClusterDeploymentStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    #[garde(skip)]
    pub platform: Platform,
    #[garde(skip)]
    #[serde(default)]
    pub installed: bool,
    #[garde(skip)]
    pub power_state: Option<ClusterPowerState>,
    /// Idle duration (e.g. `8h`) after which a running cluster is hibernated
    #[garde(custom(validate_hibernate_after))]
    pub hibernate_after: Option<String>,
    #[garde(skip)]
    pub cluster_metadata: Option<ClusterMetadata>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentStatus {
    pub installed_timestamp: Option<DateTime<Utc>>,
    pub cluster_version: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ClusterPowerState {
    Running,
    Hibernating,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    Aws { region: String },
    Gcp { region: String },
    Azure { region: String },
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Aws { .. } => "aws",
            Platform::Gcp { .. } => "gcp",
            Platform::Azure { .. } => "azure",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    #[serde(rename = "infraID")]
    pub infra_id: String,
    pub admin_kubeconfig_secret_ref: SecretReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

/// Longest accepted `hibernateAfter`
pub const MAX_HIBERNATE_AFTER: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

fn validate_hibernate_after(value: &Option<String>, _context: &()) -> garde::Result {
    let Some(raw) = value else {
        return Ok(());
    };
    let after = humantime::parse_duration(raw)
        .map_err(|e| garde::Error::new(format!("invalid duration {raw:?}: {e}")))?;
    if after > MAX_HIBERNATE_AFTER {
        return Err(garde::Error::new(format!(
            "{raw:?} is longer than the maximum of {}",
            humantime::format_duration(MAX_HIBERNATE_AFTER)
        )));
    }
    Ok(())
}

impl ClusterDeployment {
    pub fn hibernation_condition(&self) -> Option<&ClusterCondition> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.get(HIBERNATING_CONDITION))
    }

    pub fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    pub fn installed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.installed_timestamp)
    }

    pub fn cluster_version(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.cluster_version.as_deref())
    }

    /// Parsed `hibernateAfter`; `None` when unset or invalid (validation reports the latter).
    pub fn hibernate_after(&self) -> Option<Duration> {
        self.spec
            .hibernate_after
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }

    pub fn is_fake(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FAKE_CLUSTER_ANNOTATION))
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "lifecycle.dev", version = "v1", kind = "ClusterSync", namespaced)]
#[kube(status = "ClusterSyncStatus")]
pub struct ClusterSyncSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSyncStatus {
    /// First time every syncset applied successfully
    pub first_success_time: Option<DateTime<Utc>>,
}

impl ClusterSync {
    pub fn syncsets_applied(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.first_success_time.is_some())
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    fn spec(hibernate_after: Option<&str>) -> ClusterDeploymentSpec {
        ClusterDeploymentSpec {
            platform: Platform::Aws {
                region: "us-east-1".to_string(),
            },
            installed: true,
            power_state: None,
            hibernate_after: hibernate_after.map(str::to_string),
            cluster_metadata: None,
        }
    }

    #[test]
    fn hibernate_after_must_be_a_duration() {
        assert!(spec(Some("8h")).validate().is_ok());
        assert!(spec(Some("90m")).validate().is_ok());
        assert!(spec(None).validate().is_ok());
        assert!(spec(Some("eight hours")).validate().is_err());
    }

    #[test]
    fn hibernate_after_is_capped() {
        assert!(spec(Some("10years")).validate().is_err());
        assert!(spec(Some("300000years")).validate().is_err());
        assert!(spec(Some("365days")).validate().is_ok());
    }

    #[test]
    fn power_state_wire_names() {
        let json = serde_json::to_value(ClusterPowerState::Hibernating).unwrap();
        assert_eq!(json, "Hibernating");
    }

    #[test]
    fn crds_render() {
        let crd = ClusterDeployment::crd();
        assert_eq!(crd.spec.group, "lifecycle.dev");
        assert_eq!(ClusterSync::crd().spec.names.kind, "ClusterSync");
    }

    #[test]
    fn fake_annotation() {
        let mut cd = ClusterDeployment::new("c", spec(None));
        assert!(!cd.is_fake());
        cd.metadata.annotations = Some(
            [(FAKE_CLUSTER_ANNOTATION.to_string(), "True".to_string())].into(),
        );
        assert!(cd.is_fake());
    }
}
