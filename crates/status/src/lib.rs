//! Kiln condition aggregation.
//!
//! Folds per-resource submission and health verdicts into resource and owner
//! conditions. Severity is `True < Unknown < False`; the first entry holding the
//! worst status supplies reason and message. [`stabilize`] carries
//! `lastTransitionTime` over from the previous status when a condition's status
//! is unchanged, so recomputing the same state yields identical bytes.

#![forbid(unsafe_code)]

use kiln_core::condition::{reasons, types};
use kiln_core::{Condition, ConditionStatus, ObjectKey, Output, OwnerStatus, ResourceStatus, TemplateIdent, Verdict};
use tracing::trace;

/// One resource's outcome for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub name: String,
    pub template: Option<TemplateIdent>,
    pub stamped_ref: Option<ObjectKey>,
    pub outputs: Vec<Output>,
    pub submitted: Verdict,
    pub health: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregated {
    pub conditions: Vec<Condition>,
    pub resources: Vec<ResourceStatus>,
}

/// First verdict with the worst status, or `all_true` when every verdict is True.
pub fn worst<'a>(verdicts: impl IntoIterator<Item = &'a Verdict>, all_true: &str) -> Verdict {
    let mut out: Option<&Verdict> = None;
    for v in verdicts {
        match out {
            Some(w) if v.status <= w.status => {}
            _ => out = Some(v),
        }
    }
    match out {
        Some(v) if v.status != ConditionStatus::True => v.clone(),
        _ => Verdict::ok(all_true),
    }
}

/// Build owner and per-resource conditions. When the blueprint verdict is not
/// True no resources were realized and only the selection outcome is reported.
pub fn aggregate(blueprint_kind: &str, blueprint: &Verdict, resources: &[ResourceOutcome], now: &str) -> Aggregated {
    let blueprint_type = types::blueprint_ready(blueprint_kind);
    if blueprint.status != ConditionStatus::True {
        return Aggregated {
            conditions: vec![
                blueprint.clone().into_condition(&blueprint_type, now),
                blueprint.clone().into_condition(types::READY, now),
            ],
            resources: Vec::new(),
        };
    }

    let statuses: Vec<ResourceStatus> = resources.iter().map(|r| resource_status(r, now)).collect();
    let submitted = worst(resources.iter().map(|r| &r.submitted), reasons::RESOURCE_SUBMISSION_COMPLETE);
    let healthy = worst(resources.iter().map(|r| &r.health), reasons::READY);
    let ready = worst([blueprint, &submitted, &healthy], reasons::READY);
    trace!(submitted = %submitted.status, healthy = %healthy.status, ready = %ready.status, "status: aggregated");

    Aggregated {
        conditions: vec![
            blueprint.clone().into_condition(&blueprint_type, now),
            submitted.into_condition(types::RESOURCES_SUBMITTED, now),
            healthy.into_condition(types::RESOURCES_HEALTHY, now),
            ready.into_condition(types::READY, now),
        ],
        resources: statuses,
    }
}

fn resource_status(r: &ResourceOutcome, now: &str) -> ResourceStatus {
    let ready = worst([&r.submitted, &r.health], reasons::READY);
    ResourceStatus {
        name: r.name.clone(),
        template_ref: r.template.clone(),
        stamped_ref: r.stamped_ref.clone(),
        outputs: r.outputs.iter().map(Output::status).collect(),
        conditions: vec![
            r.submitted.clone().into_condition(types::RESOURCE_SUBMITTED, now),
            r.health.clone().into_condition(types::HEALTHY, now),
            ready.into_condition(types::READY, now),
        ],
    }
}

/// Keep `lastTransitionTime` of every condition in `next` whose status equals
/// the same-typed condition in `previous`.
pub fn stabilize(previous: &[Condition], next: &mut [Condition]) {
    for c in next.iter_mut() {
        if let Some(p) = kiln_core::condition::find(previous, &c.type_) {
            if p.status == c.status {
                c.last_transition_time = p.last_transition_time.clone();
            }
        }
    }
}

/// [`stabilize`] applied to owner conditions and to each resource by name.
pub fn stabilize_status(previous: &OwnerStatus, next: &mut OwnerStatus) {
    stabilize(&previous.conditions, &mut next.conditions);
    for r in next.resources.iter_mut() {
        if let Some(p) = previous.resource(&r.name) {
            stabilize(&p.conditions, &mut r.conditions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_prefers_first_false_over_unknown() {
        let vs = [
            Verdict::ok("A"),
            Verdict::unknown("B", "waiting"),
            Verdict::failed("C", "boom"),
            Verdict::failed("D", "also"),
        ];
        assert_eq!(worst(vs.iter(), "AllGood").reason, "C");
        assert_eq!(worst(vs[..2].iter(), "AllGood").reason, "B");
        assert_eq!(worst(vs[..1].iter(), "AllGood"), Verdict::ok("AllGood"));
        assert_eq!(worst(std::iter::empty(), "AllGood"), Verdict::ok("AllGood"));
    }

    #[test]
    fn stabilize_keeps_time_only_when_status_is_unchanged() {
        let prev = vec![
            Verdict::ok("Ready").into_condition("Ready", "t0"),
            Verdict::ok("Ready").into_condition("Healthy", "t0"),
        ];
        let mut next = vec![
            Verdict::ok("Other").into_condition("Ready", "t1"),
            Verdict::failed("Bad", "").into_condition("Healthy", "t1"),
            Verdict::ok("New").into_condition("Fresh", "t1"),
        ];
        stabilize(&prev, &mut next);
        let times: Vec<&str> = next.iter().map(|c| c.last_transition_time.as_str()).collect();
        assert_eq!(times, vec!["t0", "t1", "t1"]);
        assert_eq!(next[0].reason, "Other");
    }
}
