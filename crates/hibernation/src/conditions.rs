//! Status conditions for cluster deployments
//!
//! Conditions are kept in a map keyed by condition type. On the wire they are
//! a list ordered by type, so repeated writes of the same set are byte-stable.

use std::{borrow::Cow, collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Condition type carrying the power lifecycle of a cluster
pub const HIBERNATING_CONDITION: &str = "Hibernating";
/// Condition type set by the connectivity controller when the remote API is not reachable
pub const UNREACHABLE_CONDITION: &str = "Unreachable";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Reasons recorded on the `Hibernating` condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HibernationReason {
    Running,
    Stopping,
    Hibernating,
    Resuming,
    FailedToStop,
    FailedToStart,
    Unsupported,
    SyncSetsNotApplied,
}

impl HibernationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HibernationReason::Running => "Running",
            HibernationReason::Stopping => "Stopping",
            HibernationReason::Hibernating => "Hibernating",
            HibernationReason::Resuming => "Resuming",
            HibernationReason::FailedToStop => "FailedToStop",
            HibernationReason::FailedToStart => "FailedToStart",
            HibernationReason::Unsupported => "Unsupported",
            HibernationReason::SyncSetsNotApplied => "SyncSetsNotApplied",
        }
    }

    /// Status implied by the reason: True while the cluster is (or is moving
    /// into or out of) hibernation.
    pub fn status(self) -> ConditionStatus {
        match self {
            HibernationReason::Stopping
            | HibernationReason::Hibernating
            | HibernationReason::Resuming
            | HibernationReason::FailedToStop
            | HibernationReason::FailedToStart => ConditionStatus::True,
            HibernationReason::Running
            | HibernationReason::Unsupported
            | HibernationReason::SyncSetsNotApplied => ConditionStatus::False,
        }
    }
}

impl fmt::Display for HibernationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HibernationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Running" => HibernationReason::Running,
            "Stopping" => HibernationReason::Stopping,
            "Hibernating" => HibernationReason::Hibernating,
            "Resuming" => HibernationReason::Resuming,
            "FailedToStop" => HibernationReason::FailedToStop,
            "FailedToStart" => HibernationReason::FailedToStart,
            "Unsupported" => HibernationReason::Unsupported,
            "SyncSetsNotApplied" => HibernationReason::SyncSetsNotApplied,
            other => return Err(format!("unknown hibernation reason {other:?}")),
        })
    }
}

impl ClusterCondition {
    /// Reason parsed as a hibernation reason; unknown reasons read as `None`.
    pub fn hibernation_reason(&self) -> Option<HibernationReason> {
        self.reason.parse().ok()
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conditions(BTreeMap<String, ClusterCondition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&ClusterCondition> {
        self.0.get(type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(ClusterCondition::is_true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterCondition> {
        self.0.values()
    }

    /// Insert or update a condition. Returns whether anything observable changed.
    ///
    /// `last_transition_time` moves only when status or reason changes; a
    /// message-only update keeps it.
    pub fn set(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.0.get_mut(type_) {
            Some(existing)
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message =>
            {
                false
            }
            Some(existing) => {
                if existing.status != status || existing.reason != reason {
                    existing.last_transition_time = Some(now);
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.0.insert(
                    type_.to_string(),
                    ClusterCondition {
                        type_: type_.to_string(),
                        status,
                        reason: reason.to_string(),
                        message: message.to_string(),
                        last_transition_time: Some(now),
                    },
                );
                true
            }
        }
    }

    /// Set the `Hibernating` condition, deriving status from the reason.
    pub fn set_hibernation(
        &mut self,
        reason: HibernationReason,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.set(
            HIBERNATING_CONDITION,
            reason.status(),
            reason.as_str(),
            message,
            now,
        )
    }
}

impl FromIterator<ClusterCondition> for Conditions {
    fn from_iter<I: IntoIterator<Item = ClusterCondition>>(iter: I) -> Self {
        Conditions(iter.into_iter().map(|c| (c.type_.clone(), c)).collect())
    }
}

impl Serialize for Conditions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Duplicate types collapse; the last entry wins.
        let list = Option::<Vec<ClusterCondition>>::deserialize(deserializer)?;
        Ok(list.unwrap_or_default().into_iter().collect())
    }
}

impl JsonSchema for Conditions {
    fn schema_name() -> Cow<'static, str> {
        "Conditions".into()
    }

    fn inline_schema() -> bool {
        true
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        Vec::<ClusterCondition>::json_schema(generator)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn status_follows_reason() {
        for reason in [
            HibernationReason::Stopping,
            HibernationReason::Hibernating,
            HibernationReason::Resuming,
            HibernationReason::FailedToStop,
            HibernationReason::FailedToStart,
        ] {
            assert_eq!(reason.status(), ConditionStatus::True, "{reason}");
        }
        for reason in [
            HibernationReason::Running,
            HibernationReason::Unsupported,
            HibernationReason::SyncSetsNotApplied,
        ] {
            assert_eq!(reason.status(), ConditionStatus::False, "{reason}");
        }
    }

    #[test]
    fn set_reports_no_change_for_identical_condition() {
        let mut conditions = Conditions::default();
        assert!(conditions.set_hibernation(HibernationReason::Stopping, "stopping", t(1)));
        assert!(!conditions.set_hibernation(HibernationReason::Stopping, "stopping", t(2)));
        let cond = conditions.get(HIBERNATING_CONDITION).unwrap();
        assert_eq!(cond.last_transition_time, Some(t(1)));
    }

    #[test]
    fn message_change_keeps_transition_time() {
        let mut conditions = Conditions::default();
        conditions.set_hibernation(HibernationReason::Unsupported, "old", t(1));
        assert!(conditions.set_hibernation(HibernationReason::Unsupported, "new", t(2)));
        let cond = conditions.get(HIBERNATING_CONDITION).unwrap();
        assert_eq!(cond.message, "new");
        assert_eq!(cond.last_transition_time, Some(t(1)));

        assert!(conditions.set_hibernation(HibernationReason::Running, "new", t(3)));
        let cond = conditions.get(HIBERNATING_CONDITION).unwrap();
        assert_eq!(cond.last_transition_time, Some(t(3)));
        assert_eq!(cond.status, ConditionStatus::False);
    }

    #[test]
    fn serializes_as_list_ordered_by_type() {
        let mut conditions = Conditions::default();
        conditions.set(UNREACHABLE_CONDITION, ConditionStatus::False, "Ok", "", t(1));
        conditions.set_hibernation(HibernationReason::Running, "", t(1));

        let json = serde_json::to_value(&conditions).unwrap();
        let types: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["Hibernating", "Unreachable"]);

        let back: Conditions = serde_json::from_value(json).unwrap();
        assert_eq!(back, conditions);
    }

    #[test]
    fn unknown_reason_is_not_a_hibernation_reason() {
        let cond = ClusterCondition {
            type_: HIBERNATING_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: "SomethingElse".to_string(),
            message: String::new(),
            last_transition_time: None,
        };
        assert_eq!(cond.hibernation_reason(), None);
    }
}
