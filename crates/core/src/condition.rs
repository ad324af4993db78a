//! Condition lattice and the stable type/reason taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tri-state condition status ordered by severity: `True < Unknown < False`.
///
/// Folding a set of statuses with [`ConditionStatus::worst`] is associative and
/// commutative, which keeps aggregation independent of resource order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    Unknown,
    False,
}

impl ConditionStatus {
    pub fn worst(self, other: Self) -> Self { self.max(other) }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::Unknown => "Unknown",
            ConditionStatus::False => "False",
        }
    }

    pub fn is_true(&self) -> bool { matches!(self, ConditionStatus::True) }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Health of a single stamped object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl From<HealthState> for ConditionStatus {
    fn from(h: HealthState) -> Self {
        match h {
            HealthState::Healthy => ConditionStatus::True,
            HealthState::Unhealthy => ConditionStatus::False,
            HealthState::Unknown => ConditionStatus::Unknown,
        }
    }
}

/// A status/reason/message triple not yet bound to a condition type or timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl Verdict {
    pub fn new(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), message: message.into() }
    }

    pub fn ok(reason: impl Into<String>) -> Self { Self::new(ConditionStatus::True, reason, "") }
    pub fn unknown(reason: impl Into<String>, message: impl Into<String>) -> Self { Self::new(ConditionStatus::Unknown, reason, message) }
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self { Self::new(ConditionStatus::False, reason, message) }

    pub fn into_condition(self, type_: &str, now: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: self.status,
            reason: self.reason,
            message: self.message,
            last_transition_time: now.to_string(),
        }
    }
}

/// Kubernetes-shaped status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// RFC3339 timestamp (seconds precision).
    pub last_transition_time: String,
}

impl Condition {
    pub fn verdict(&self) -> Verdict { Verdict::new(self.status, self.reason.clone(), self.message.clone()) }
}

/// Render a timestamp the way the API server stores `metav1.Time`.
pub fn timestamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Condition types.
pub mod types {
    pub const READY: &str = "Ready";
    pub const RESOURCE_SUBMITTED: &str = "ResourceSubmitted";
    pub const HEALTHY: &str = "Healthy";
    pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
    pub const RESOURCES_HEALTHY: &str = "ResourcesHealthy";
    pub const SUCCEEDED: &str = "Succeeded";

    /// Owner condition type reporting blueprint selection, e.g. `SupplyChainReady`.
    pub fn blueprint_ready(blueprint_kind: &str) -> String { format!("{}Ready", blueprint_kind) }
}

/// Condition reasons.
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const RESOURCE_SUBMISSION_COMPLETE: &str = "ResourceSubmissionComplete";
    pub const TEMPLATE_STAMP_FAILURE: &str = "TemplateStampFailure";
    pub const TEMPLATE_OBJECT_RETRIEVAL_FAILURE: &str = "TemplateObjectRetrievalFailure";
    pub const TEMPLATE_OPTIONS_MATCH_ERROR: &str = "TemplateOptionsMatchError";
    pub const TEMPLATE_REJECTED_BY_API_SERVER: &str = "TemplateRejectedByAPIServer";
    pub const MISSING_VALUE_AT_PATH: &str = "MissingValueAtPath";
    pub const MISSING_UPSTREAM_OUTPUT: &str = "MissingUpstreamOutput";
    pub const OBJECT_STORE_UNAVAILABLE: &str = "ObjectStoreUnavailable";
    pub const NO_HEALTHY_IMMUTABLE_OBJECT: &str = "SetOfImmutableStampedObjectsIncludesNoHealthyObject";
    pub const NO_HEALTHY_IMMUTABLE_OBJECT_MESSAGE: &str = "no healthy object found in the set of immutable stamped objects";

    pub const ALWAYS_HEALTHY: &str = "AlwaysHealthy";
    pub const SUCCEEDED_CONDITION: &str = "SucceededCondition";
    pub const MATCHED_CONDITION: &str = "MatchedCondition";
    pub const MATCHED_FIELD: &str = "MatchedField";
    pub const NO_MATCHES_FULFILLED: &str = "NoMatchesFulfilled";
    pub const NO_STAMPED_OBJECT: &str = "NoStampedObject";

    pub const OWNER_LABELS_MISSING: &str = "OwnerLabelsMissing";

    /// `<Type>Condition`, reported by single-condition health rules.
    pub fn condition_rule(condition_type: &str) -> String { format!("{}Condition", condition_type) }
    pub fn blueprint_not_found(kind: &str) -> String { format!("{}NotFound", kind) }
    pub fn multiple_blueprint_matches(kind: &str) -> String { format!("Multiple{}Matches", kind) }
    pub fn blueprint_selector_invalid(kind: &str) -> String { format!("{}SelectorInvalid", kind) }
}

/// Event reasons.
pub mod events {
    pub const STAMPED_OBJECT_APPLIED: &str = "StampedObjectApplied";
    pub const STAMPED_OBJECT_REMOVED: &str = "StampedObjectRemoved";
}
