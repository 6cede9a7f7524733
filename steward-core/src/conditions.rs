//! Status conditions, keyed by their `type`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state truth value of a [`Condition`]
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The controller could not tell
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => f.write_str("True"),
            Self::False => f.write_str("False"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

/// One aspect of the observed state of an object
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The aspect this condition describes, unique within an object
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the aspect currently holds
    pub status: ConditionStatus,
    /// Machine readable CamelCase reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human readable details
    #[serde(default)]
    pub message: String,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Build a condition stamped with the current time
    #[must_use]
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Whether this condition has status `True`
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Upsert `condition` into `conditions`, keyed by type.
///
/// The existing `last_transition_time` is kept unless the status actually changed.
/// Returns whether anything (status, reason or message) changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let changed = existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message;
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
                existing.status = condition.status;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Remove a condition by type, returning whether it was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_condition_inserts_new_type() {
        let mut conds = vec![];
        assert!(set_condition(
            &mut conds,
            Condition::new("Available", ConditionStatus::False, "Creating", "")
        ));
        assert_eq!(conds.len(), 1);
        assert_eq!(find_condition(&conds, "Available").unwrap().reason, "Creating");
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let first = Condition::new("Available", ConditionStatus::False, "Creating", "");
        let stamped = first.last_transition_time;
        let mut conds = vec![first];

        let mut same_status = Condition::new("Available", ConditionStatus::False, "Waiting", "still going");
        same_status.last_transition_time = stamped + Duration::seconds(30);
        assert!(set_condition(&mut conds, same_status));
        assert_eq!(conds[0].last_transition_time, stamped);
        assert_eq!(conds[0].reason, "Waiting");

        let mut flipped = Condition::new("Available", ConditionStatus::True, "Ready", "");
        flipped.last_transition_time = stamped + Duration::seconds(60);
        assert!(set_condition(&mut conds, flipped));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].last_transition_time, stamped + Duration::seconds(60));
    }

    #[test]
    fn identical_condition_is_not_a_change() {
        let cond = Condition::new("Degraded", ConditionStatus::False, "AsExpected", "");
        let mut conds = vec![cond.clone()];
        assert!(!set_condition(&mut conds, cond));
    }

    #[test]
    fn status_serializes_as_plain_strings() {
        let cond = Condition::new("Available", ConditionStatus::True, "Ready", "");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Available");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn remove_condition_by_type() {
        let mut conds = vec![Condition::new("Degraded", ConditionStatus::True, "BadSpec", "")];
        assert!(remove_condition(&mut conds, "Degraded"));
        assert!(!remove_condition(&mut conds, "Degraded"));
    }
}
