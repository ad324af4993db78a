//! Blueprint and template option selection with condition-ready failures.

use kiln_core::condition::reasons;
use kiln_core::{Blueprint, Owner, PathQuery, TemplateOption, Verdict};
use kiln_selector::best_match;
use tracing::warn;

fn label_map(owner: &Owner) -> String {
    let pairs: Vec<String> = owner.labels.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
    format!("map[{}]", pairs.join(" "))
}

/// The single best-matching blueprint, or the verdict explaining why there is none.
pub fn select_blueprint(query: &dyn PathQuery, owner: &Owner, blueprints: &[Blueprint], kind: &str) -> Result<Blueprint, Verdict> {
    let report = best_match(query, owner, blueprints);
    for e in report.errors.iter() {
        warn!(owner = %owner.key, blueprint = %e.name, error = %e, "select: selector failed");
    }
    match report.winners.as_slice() {
        [one] => Ok(blueprints[*one].clone()),
        [] => {
            if let Some(e) = report.errors.first() {
                return Err(Verdict::failed(reasons::blueprint_selector_invalid(kind), e.to_string()));
            }
            if owner.labels.is_empty() {
                return Err(Verdict::failed(reasons::OWNER_LABELS_MISSING, format!("{} is missing required labels", owner.key.kind)));
            }
            Err(Verdict::failed(
                reasons::blueprint_not_found(kind),
                format!("no {} found where full selector is satisfied by labels: {}", kind, label_map(owner)),
            ))
        }
        many => {
            let names: Vec<&str> = many.iter().map(|i| blueprints[*i].name.as_str()).collect();
            Err(Verdict::failed(
                reasons::multiple_blueprint_matches(kind),
                format!("more than one {} selected for {}: {}", kind, owner.key.kind, names.join(", ")),
            ))
        }
    }
}

/// The template option whose selector matches `owner` best.
pub fn select_option<'a>(query: &dyn PathQuery, owner: &Owner, resource: &str, options: &'a [TemplateOption]) -> Result<&'a TemplateOption, Verdict> {
    let report = best_match(query, owner, options);
    if let Some(e) = report.errors.first() {
        return Err(Verdict::failed(
            reasons::TEMPLATE_OPTIONS_MATCH_ERROR,
            format!("error matching against template option [{}] for resource [{}]: {}", e.name, resource, e.kind),
        ));
    }
    match report.winners.as_slice() {
        [one] => Ok(&options[*one]),
        [] => Err(Verdict::failed(
            reasons::TEMPLATE_OPTIONS_MATCH_ERROR,
            format!("no template option matched for resource [{}]", resource),
        )),
        many => {
            let names: Vec<&str> = many.iter().map(|i| options[*i].name.as_str()).collect();
            Err(Verdict::failed(
                reasons::TEMPLATE_OPTIONS_MATCH_ERROR,
                format!("expected exactly 1 option to match, found [{}] for resource [{}]", names.join(", "), resource),
            ))
        }
    }
}
