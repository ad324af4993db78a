#![forbid(unsafe_code)]

use kiln_core::condition::find;
use kiln_core::{ConditionStatus, ObjectKey, Output, OwnerStatus, TemplateIdent, TypeKey, Verdict};
use kiln_status::{aggregate, stabilize_status, ResourceOutcome};

fn outcome(name: &str, submitted: Verdict, health: Verdict) -> ResourceOutcome {
    ResourceOutcome {
        name: name.into(),
        template: Some(TemplateIdent { kind: "ClusterTemplate".into(), name: format!("{}-tpl", name) }),
        stamped_ref: Some(ObjectKey::new(&TypeKey::new("v1", "ConfigMap"), Some("dev"), format!("app-{}", name))),
        outputs: vec![Output::new("config", serde_json::json!({ "url": "git://x" }))],
        submitted,
        health,
    }
}

fn status_of(agg: kiln_status::Aggregated) -> OwnerStatus {
    OwnerStatus { observed_generation: 1, conditions: agg.conditions, resources: agg.resources, blueprint_ref: None }
}

#[test]
fn all_true_uses_completion_reasons() {
    let rs = vec![
        outcome("source", Verdict::ok("ResourceSubmissionComplete"), Verdict::ok("ReadyCondition")),
        outcome("image", Verdict::ok("ResourceSubmissionComplete"), Verdict::ok("AlwaysHealthy")),
    ];
    let agg = aggregate("SupplyChain", &Verdict::ok("Ready"), &rs, "t0");
    let types: Vec<&str> = agg.conditions.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types, vec!["SupplyChainReady", "ResourcesSubmitted", "ResourcesHealthy", "Ready"]);
    assert!(agg.conditions.iter().all(|c| c.status == ConditionStatus::True));
    assert_eq!(find(&agg.conditions, "ResourcesSubmitted").unwrap().reason, "ResourceSubmissionComplete");
    assert_eq!(find(&agg.conditions, "Ready").unwrap().reason, "Ready");
    assert_eq!(agg.resources[0].outputs[0].preview, r#"{"url":"git://x"}"#);
    assert_eq!(find(&agg.resources[1].conditions, "Healthy").unwrap().reason, "AlwaysHealthy");
}

#[test]
fn worst_resource_surfaces_on_owner() {
    let rs = vec![
        outcome("source", Verdict::ok("ResourceSubmissionComplete"), Verdict::unknown("ReadyCondition", "pending")),
        outcome("image", Verdict::failed("TemplateStampFailure", "missing param"), Verdict::unknown("NoStampedObject", "")),
        outcome("deploy", Verdict::unknown("MissingUpstreamOutput", "image"), Verdict::unknown("NoStampedObject", "")),
    ];
    let agg = aggregate("SupplyChain", &Verdict::ok("Ready"), &rs, "t0");
    let submitted = find(&agg.conditions, "ResourcesSubmitted").unwrap();
    assert_eq!((submitted.status, submitted.reason.as_str()), (ConditionStatus::False, "TemplateStampFailure"));
    let healthy = find(&agg.conditions, "ResourcesHealthy").unwrap();
    assert_eq!((healthy.status, healthy.reason.as_str()), (ConditionStatus::Unknown, "ReadyCondition"));
    let ready = find(&agg.conditions, "Ready").unwrap();
    assert_eq!((ready.status, ready.reason.as_str()), (ConditionStatus::False, "TemplateStampFailure"));

    let deploy_ready = find(&agg.resources[2].conditions, "Ready").unwrap();
    assert_eq!((deploy_ready.status, deploy_ready.reason.as_str()), (ConditionStatus::Unknown, "MissingUpstreamOutput"));
}

#[test]
fn failed_selection_reports_no_resources() {
    let v = Verdict::failed("SupplyChainNotFound", "no supply chain found where full selector is satisfied by labels: map[]");
    let agg = aggregate("SupplyChain", &v, &[], "t0");
    assert!(agg.resources.is_empty());
    assert_eq!(agg.conditions.len(), 2);
    assert_eq!(find(&agg.conditions, "Ready").unwrap().reason, "SupplyChainNotFound");
}

#[test]
fn recomputation_is_byte_identical() {
    let rs = vec![outcome("source", Verdict::ok("ResourceSubmissionComplete"), Verdict::unknown("ReadyCondition", "pending"))];
    let first = status_of(aggregate("Delivery", &Verdict::ok("Ready"), &rs, "2026-01-01T00:00:00Z"));

    let mut second = status_of(aggregate("Delivery", &Verdict::ok("Ready"), &rs, "2026-01-01T00:05:00Z"));
    stabilize_status(&first, &mut second);
    assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());

    // a flipped resource moves only the conditions whose status changed
    let rs = vec![outcome("source", Verdict::ok("ResourceSubmissionComplete"), Verdict::ok("ReadyCondition"))];
    let mut third = status_of(aggregate("Delivery", &Verdict::ok("Ready"), &rs, "2026-01-01T00:10:00Z"));
    stabilize_status(&second, &mut third);
    let t = |s: &OwnerStatus, ty: &str| find(&s.conditions, ty).unwrap().last_transition_time.clone();
    assert_eq!(t(&third, "DeliveryReady"), "2026-01-01T00:00:00Z");
    assert_eq!(t(&third, "ResourcesHealthy"), "2026-01-01T00:10:00Z");
    let res_t = |s: &OwnerStatus, ty: &str| find(&s.resources[0].conditions, ty).unwrap().last_transition_time.clone();
    assert_eq!(res_t(&third, "ResourceSubmitted"), "2026-01-01T00:00:00Z");
    assert_eq!(res_t(&third, "Healthy"), "2026-01-01T00:10:00Z");
}
