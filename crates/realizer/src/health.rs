//! Health rules: map a stamped object's status to a verdict.

use kiln_core::condition::{reasons, types};
use kiln_core::object::meta;
use kiln_core::{ConditionStatus, HealthRule, HealthState, Json, MatchRule, PathQuery, Verdict};
use kiln_eval::scalar_string;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub state: HealthState,
    pub reason: String,
    pub message: String,
}

impl HealthVerdict {
    fn new(state: HealthState, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { state, reason: reason.into(), message: message.into() }
    }

    pub fn no_stamped_object() -> Self {
        Self::new(HealthState::Unknown, reasons::NO_STAMPED_OBJECT, "no stamped object")
    }

    pub fn is_healthy(&self) -> bool { self.state == HealthState::Healthy }

    pub fn verdict(&self) -> Verdict { Verdict::new(ConditionStatus::from(self.state), self.reason.clone(), self.message.clone()) }
}

/// Evaluate `rule` against `object`. Without a rule the object's `Ready`
/// condition is mirrored.
pub fn evaluate(query: &dyn PathQuery, object: Option<&Json>, rule: Option<&HealthRule>) -> HealthVerdict {
    let Some(obj) = object else {
        return HealthVerdict::no_stamped_object();
    };
    match rule {
        Some(r) if r.always_healthy.is_some() => HealthVerdict::new(HealthState::Healthy, reasons::ALWAYS_HEALTHY, ""),
        Some(HealthRule { single_condition_type: Some(t), .. }) => mirror_condition(obj, t),
        Some(HealthRule { multi_match: Some(mm), .. }) => multi_match(query, obj, &mm.healthy, &mm.unhealthy),
        _ => mirror_condition(obj, types::READY),
    }
}

fn mirror_condition(obj: &Json, condition_type: &str) -> HealthVerdict {
    let reason = reasons::condition_rule(condition_type);
    match meta::conditions(obj).into_iter().find(|(t, ..)| *t == condition_type) {
        Some((_, "True", _, msg)) => HealthVerdict::new(HealthState::Healthy, reason, msg),
        Some((_, "False", _, msg)) => HealthVerdict::new(HealthState::Unhealthy, reason, msg),
        Some((_, _, _, msg)) => HealthVerdict::new(HealthState::Unknown, reason, msg),
        None => HealthVerdict::new(HealthState::Unknown, reason, format!("condition {} not found", condition_type)),
    }
}

fn multi_match(query: &dyn PathQuery, obj: &Json, healthy: &MatchRule, unhealthy: &MatchRule) -> HealthVerdict {
    let conds = meta::conditions(obj);
    let condition_hit = |t: &str, s: &str| conds.iter().find(|(ct, cs, ..)| *ct == t && *cs == s);

    for req in unhealthy.match_conditions.iter() {
        if let Some((_, s, _, m)) = condition_hit(&req.type_, &req.status) {
            return HealthVerdict::new(
                HealthState::Unhealthy,
                reasons::MATCHED_CONDITION,
                format!("condition {} is {}: {}", req.type_, s, m),
            );
        }
    }
    for req in unhealthy.match_fields.iter() {
        match kiln_selector::matches(query, req, obj) {
            Ok(true) => {
                return HealthVerdict::new(HealthState::Unhealthy, reasons::MATCHED_FIELD, field_message(query, obj, &req.key));
            }
            Ok(false) => {}
            Err(e) => return HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, e.to_string()),
        }
    }

    if healthy.is_empty() {
        return HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, "no healthy rule matched");
    }
    if !healthy.match_conditions.iter().all(|r| condition_hit(&r.type_, &r.status).is_some()) {
        return HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, "healthy conditions not met");
    }
    match kiln_selector::matches_all_fields(query, &healthy.match_fields, obj) {
        Ok(true) => {}
        Ok(false) => return HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, "healthy fields not met"),
        Err(e) => return HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, e.to_string()),
    }
    match (healthy.match_conditions.first(), healthy.match_fields.first()) {
        (Some(c), _) => {
            let msg = condition_hit(&c.type_, &c.status).map(|(.., m)| *m).unwrap_or_default();
            HealthVerdict::new(HealthState::Healthy, reasons::MATCHED_CONDITION, format!("condition {} is {}: {}", c.type_, c.status, msg))
        }
        (None, Some(f)) => HealthVerdict::new(HealthState::Healthy, reasons::MATCHED_FIELD, field_message(query, obj, &f.key)),
        (None, None) => HealthVerdict::new(HealthState::Unknown, reasons::NO_MATCHES_FULFILLED, ""),
    }
}

fn field_message(query: &dyn PathQuery, obj: &Json, key: &str) -> String {
    match query.query(obj, key) {
        Ok(v) => format!("field {} is {}", key, scalar_string(&v).unwrap_or_else(|| v.to_string())),
        Err(_) => format!("field {} is absent", key),
    }
}
