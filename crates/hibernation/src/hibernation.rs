//! Hibernation state machine
//!
//! One call to [`HibernationMachine::evaluate`] looks at the stored
//! `Hibernating` condition and the desired power state, makes at most one
//! round of actuator / remote calls, and returns the condition the cluster
//! should carry next. Nothing is persisted here; the reconciler writes the
//! [`Outcome`] afterwards, so every call recomputes from observed state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    actuator::HibernationActuator,
    admission::{Admission, CsrHelper, admit_nodes},
    api::{ClusterDeployment, ClusterPowerState},
    conditions::HibernationReason,
    config::HibernationConfig,
    remote::RemoteClientBuilder,
    schedule::{
        AutoHibernate, SYNCSETS_GRACE_PERIOD, auto_hibernate, elapsed, next_deadline, sooner,
    },
};

pub const HIBERNATION_CAPABLE_MESSAGE: &str = "Hibernation capable";
pub const SYNCSETS_NOT_APPLIED_MESSAGE: &str = "Cluster SyncSets have not been applied";
pub const STOPPING_MESSAGE: &str = "Stopping cluster machines";
pub const STOPPED_MESSAGE: &str = "Cluster is stopped";
pub const STARTING_MESSAGE: &str = "Starting cluster machines";
pub const RUNNING_MESSAGE: &str = "All machines are started and nodes are ready";
pub const HIBERNATION_WITHDRAWN_MESSAGE: &str = "Hibernation request withdrawn";

/// What the reconciler should do with the cluster after one evaluation
#[derive(Debug, Default)]
pub struct Outcome {
    /// Next `Hibernating` condition, if it should be (re)written
    pub condition: Option<(HibernationReason, String)>,
    /// Desired power state forced by the hibernate-after timer
    pub power_state: Option<ClusterPowerState>,
    pub requeue_after: Option<Duration>,
    /// Reported after the condition is persisted
    pub error: Option<Error>,
}

impl Outcome {
    fn requeue(after: Option<Duration>) -> Self {
        Self {
            requeue_after: after,
            ..Default::default()
        }
    }

    fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// Check the cluster's reported version against the minimum that supports hibernation.
pub fn version_support(cluster: &ClusterDeployment, minimum: &Version) -> Result<(), String> {
    let raw = cluster
        .cluster_version()
        .ok_or_else(|| "No cluster version is available yet".to_string())?;
    let version = Version::parse(raw.trim_start_matches('v'))
        .map_err(|e| format!("Cannot parse cluster version {raw:?}: {e}"))?;

    // Pre-release builds of a supported release are supported.
    if (version.major, version.minor, version.patch) < (minimum.major, minimum.minor, minimum.patch)
    {
        return Err(format!(
            "Unsupported version {raw}, need version {minimum} or greater"
        ));
    }
    Ok(())
}

pub struct HibernationMachine<'a> {
    pub actuator: &'a dyn HibernationActuator,
    pub remote: &'a dyn RemoteClientBuilder,
    pub csr: &'a dyn CsrHelper,
    pub config: &'a HibernationConfig,
}

impl HibernationMachine<'_> {
    fn transition(&self, reason: HibernationReason, message: impl Into<String>) -> Outcome {
        Outcome {
            condition: Some((reason, message.into())),
            requeue_after: next_deadline(reason, self.config),
            ..Default::default()
        }
    }

    fn poll(&self, reason: HibernationReason) -> Outcome {
        Outcome::requeue(next_deadline(reason, self.config))
    }

    /// Blocks hibernation inside the grace period while syncsets are unapplied.
    fn syncset_gate(&self, syncsets_applied: bool, install_age: Duration) -> Option<Outcome> {
        if syncsets_applied || install_age >= SYNCSETS_GRACE_PERIOD {
            return None;
        }
        tracing::info!("syncsets not yet applied, delaying hibernation");
        let blocked = self.transition(
            HibernationReason::SyncSetsNotApplied,
            SYNCSETS_NOT_APPLIED_MESSAGE,
        );
        let requeue_after = blocked.requeue_after.unwrap_or_default();
        Some(blocked.with_error(Error::SyncSetsNotApplied { requeue_after }))
    }

    /// Compute the next step for an installed, live cluster.
    ///
    /// `Err` means nothing about the condition changed; an `Outcome` may
    /// still carry an error to report once its condition is written.
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn evaluate(
        &self,
        cluster: &ClusterDeployment,
        syncsets_applied: bool,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let condition = cluster.hibernation_condition();
        let reason = condition.and_then(|c| c.hibernation_reason());
        let in_flight = condition.is_some_and(|c| c.is_true());
        let wants_hibernation = cluster.spec.power_state == Some(ClusterPowerState::Hibernating);
        let relevant = wants_hibernation || cluster.spec.hibernate_after.is_some();

        match version_support(cluster, &self.config.minimum_version) {
            // Never interrupts a stop or resume already in progress.
            Err(message) if relevant && !in_flight => {
                tracing::info!("hibernation unsupported: {message}");
                return Ok(self.transition(HibernationReason::Unsupported, message));
            }
            Ok(()) if reason == Some(HibernationReason::Unsupported) && !wants_hibernation => {
                return Ok(self.transition(
                    HibernationReason::Running,
                    HIBERNATION_CAPABLE_MESSAGE,
                ));
            }
            _ => {}
        }

        let installed = cluster.installed_timestamp().ok_or_else(|| {
            Error::Configuration("installed cluster has no installedTimestamp".to_string())
        })?;
        let install_age = elapsed(installed, now);

        let timer = match auto_hibernate(cluster, now)? {
            AutoHibernate::Due => {
                if let Some(blocked) = self.syncset_gate(syncsets_applied, install_age) {
                    return Ok(blocked);
                }
                tracing::info!("cluster has been running longer than hibernateAfter, hibernating");
                return Ok(Outcome {
                    power_state: Some(ClusterPowerState::Hibernating),
                    ..Default::default()
                });
            }
            AutoHibernate::NotDue(after) => Some(after),
            AutoHibernate::Inert => None,
        };

        let mut outcome = self
            .advance(cluster, reason, wants_hibernation, syncsets_applied, install_age)
            .await?;
        outcome.requeue_after = sooner(outcome.requeue_after, timer);
        Ok(outcome)
    }

    async fn advance(
        &self,
        cluster: &ClusterDeployment,
        reason: Option<HibernationReason>,
        wants_hibernation: bool,
        syncsets_applied: bool,
        install_age: Duration,
    ) -> Result<Outcome> {
        use HibernationReason::*;

        match (wants_hibernation, reason) {
            (true, None | Some(Running | Unsupported | SyncSetsNotApplied)) => {
                if let Some(blocked) = self.syncset_gate(syncsets_applied, install_age) {
                    return Ok(blocked);
                }
                Ok(self.stop(cluster).await)
            }
            // Retrying from a failed start keeps a cluster that was asked to
            // hibernate from sticking in FailedToStart.
            (true, Some(FailedToStop | FailedToStart | Resuming)) => Ok(self.stop(cluster).await),
            (true, Some(Stopping)) => self.check_stopped(cluster).await,
            (true, Some(Hibernating)) => Ok(Outcome::default()),
            (false, Some(Hibernating | Stopping | FailedToStop | FailedToStart)) => {
                Ok(self.start(cluster).await)
            }
            (false, Some(Resuming)) => self.check_resumed(cluster).await,
            // The hibernate request was withdrawn before any machine stopped.
            (false, Some(SyncSetsNotApplied)) => {
                Ok(self.transition(Running, HIBERNATION_WITHDRAWN_MESSAGE))
            }
            (false, None | Some(Running | Unsupported)) => Ok(Outcome::default()),
        }
    }

    async fn stop(&self, cluster: &ClusterDeployment) -> Outcome {
        match self.actuator.stop_machines(cluster).await {
            Ok(()) => {
                tracing::info!("stopping cluster machines");
                self.transition(HibernationReason::Stopping, STOPPING_MESSAGE)
            }
            Err(e) => {
                tracing::error!("failed to stop machines: {e}");
                self.transition(
                    HibernationReason::FailedToStop,
                    format!("Failed to stop machines: {e}"),
                )
                .with_error(e)
            }
        }
    }

    async fn start(&self, cluster: &ClusterDeployment) -> Outcome {
        match self.actuator.start_machines(cluster).await {
            Ok(()) => {
                tracing::info!("starting cluster machines");
                self.transition(HibernationReason::Resuming, STARTING_MESSAGE)
            }
            Err(e) => {
                tracing::error!("failed to start machines: {e}");
                self.transition(
                    HibernationReason::FailedToStart,
                    format!("Failed to start machines: {e}"),
                )
                .with_error(e)
            }
        }
    }

    async fn check_stopped(&self, cluster: &ClusterDeployment) -> Result<Outcome> {
        if !self.actuator.machines_stopped(cluster).await? {
            tracing::debug!("machines not stopped yet");
            return Ok(self.poll(HibernationReason::Stopping));
        }
        tracing::info!("cluster machines are stopped");
        Ok(self.transition(HibernationReason::Hibernating, STOPPED_MESSAGE))
    }

    async fn check_resumed(&self, cluster: &ClusterDeployment) -> Result<Outcome> {
        if !self.actuator.machines_running(cluster).await? {
            tracing::debug!("machines not running yet, reissuing start");
            return Ok(self.start(cluster).await);
        }

        if cluster.is_fake() {
            return Ok(self.transition(HibernationReason::Running, RUNNING_MESSAGE));
        }

        let remote = match self.remote.build(cluster).await {
            Ok(remote) => remote,
            Err(Error::Unreachable(message)) => {
                tracing::warn!("remote cluster unreachable: {message}");
                return Ok(Outcome::requeue(Some(self.config.unreachable_interval)));
            }
            Err(e) => return Err(e),
        };

        match admit_nodes(remote.as_ref(), self.csr).await? {
            Admission::NodesReady => {
                tracing::info!("all nodes ready, cluster is running");
                Ok(self.transition(HibernationReason::Running, RUNNING_MESSAGE))
            }
            Admission::Waiting { approved } => {
                tracing::info!(approved, "waiting for nodes to become ready");
                Ok(self.poll(HibernationReason::Resuming))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterDeploymentSpec, ClusterDeploymentStatus, Platform};

    fn cluster_with_version(version: Option<&str>) -> ClusterDeployment {
        let mut cd = ClusterDeployment::new(
            "test",
            ClusterDeploymentSpec {
                platform: Platform::Azure {
                    region: "eastus".to_string(),
                },
                installed: true,
                power_state: None,
                hibernate_after: None,
                cluster_metadata: None,
            },
        );
        cd.status = Some(ClusterDeploymentStatus {
            cluster_version: version.map(str::to_string),
            ..Default::default()
        });
        cd
    }

    #[test]
    fn versions() {
        let minimum = Version::new(4, 4, 8);
        assert!(version_support(&cluster_with_version(Some("4.4.9")), &minimum).is_ok());
        assert!(version_support(&cluster_with_version(Some("4.4.8")), &minimum).is_ok());
        assert!(version_support(&cluster_with_version(Some("4.10.0")), &minimum).is_ok());
        assert!(
            version_support(&cluster_with_version(Some("4.4.8-rc.1")), &minimum).is_ok(),
            "pre-release of a supported version"
        );
        assert!(version_support(&cluster_with_version(Some("4.3.11")), &minimum).is_err());
        assert!(version_support(&cluster_with_version(Some("4.4")), &minimum).is_err());
        assert!(version_support(&cluster_with_version(None), &minimum).is_err());
    }
}
