//! Auto-hibernate deadlines and requeue intervals
//!
//! Every requeue delay the controller hands back to the work queue comes from
//! this module, so the polling branches and the timer agree on intervals.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    Error, Result,
    api::{ClusterDeployment, ClusterPowerState},
    conditions::HibernationReason,
    config::HibernationConfig,
};

/// Window after install during which unapplied syncsets block hibernation
pub const SYNCSETS_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Retry delay while hibernation waits for syncsets
pub const SYNCSETS_RETRY_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Poll interval implied by the reason the cluster is moving to.
pub fn next_deadline(reason: HibernationReason, config: &HibernationConfig) -> Option<Duration> {
    match reason {
        HibernationReason::Stopping | HibernationReason::Resuming => {
            Some(config.state_check_interval)
        }
        HibernationReason::SyncSetsNotApplied => Some(SYNCSETS_RETRY_INTERVAL),
        HibernationReason::Running
        | HibernationReason::Hibernating
        | HibernationReason::FailedToStop
        | HibernationReason::FailedToStart
        | HibernationReason::Unsupported => None,
    }
}

/// Earliest of two optional requeue delays
pub fn sooner(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Time elapsed since `since`, clamped at zero
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoHibernate {
    /// No `hibernateAfter`, or the cluster is not running
    Inert,
    /// Running longer than `hibernateAfter`
    Due,
    /// Check again after the delay
    NotDue(Duration),
}

/// Decide whether the hibernate-after timer has fired.
///
/// The timer runs from the later of the install time and the last time the
/// cluster was confirmed running.
pub fn auto_hibernate(cluster: &ClusterDeployment, now: DateTime<Utc>) -> Result<AutoHibernate> {
    let Some(hibernate_after) = cluster.hibernate_after() else {
        return Ok(AutoHibernate::Inert);
    };
    if cluster.spec.power_state == Some(ClusterPowerState::Hibernating) {
        return Ok(AutoHibernate::Inert);
    }

    let condition = cluster.hibernation_condition();
    if condition.is_some_and(|c| c.is_true()) {
        // Stopping, hibernated, or on the way back up.
        return Ok(AutoHibernate::Inert);
    }

    let installed = cluster.installed_timestamp().ok_or_else(|| {
        Error::Configuration("installed cluster has no installedTimestamp".to_string())
    })?;
    let running_since = condition
        .filter(|c| c.hibernation_reason() == Some(HibernationReason::Running))
        .and_then(|c| c.last_transition_time)
        .map_or(installed, |t| t.max(installed));

    // A deadline past the representable range never arrives.
    let Some(deadline) = chrono::Duration::from_std(hibernate_after)
        .ok()
        .and_then(|after| running_since.checked_add_signed(after))
    else {
        tracing::warn!(?hibernate_after, "hibernateAfter deadline out of range, ignoring");
        return Ok(AutoHibernate::Inert);
    };

    if now >= deadline {
        Ok(AutoHibernate::Due)
    } else {
        Ok(AutoHibernate::NotDue(elapsed(now, deadline)))
    }
}
