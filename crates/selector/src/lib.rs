//! Kiln selector matching: pick the best-matching blueprint or template
//! option for a selectable object.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kiln_core::{Blueprint, Json, Owner, PathQuery, Selector, TemplateOption};
use tracing::debug;

pub mod fields;
pub mod labels;

pub use fields::{matches, matches_all_fields, FieldError, FieldErrorCause};
pub use labels::LabelSelector;

/// Something a selector is evaluated against.
pub trait Selectable {
    fn labels(&self) -> &BTreeMap<String, String>;
    fn document(&self) -> &Json;
}

impl Selectable for Owner {
    fn labels(&self) -> &BTreeMap<String, String> { &self.labels }
    fn document(&self) -> &Json { &self.raw }
}

/// Something that carries a selector.
pub trait SelectingObject {
    fn selector(&self) -> &Selector;
    fn name(&self) -> &str;
}

impl SelectingObject for Blueprint {
    fn selector(&self) -> &Selector { &self.spec.selector }
    fn name(&self) -> &str { &self.name }
}

impl SelectingObject for TemplateOption {
    fn selector(&self) -> &Selector { &self.selector }
    fn name(&self) -> &str { &self.name }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchErrorKind {
    #[error("selector matchLabels or matchExpressions are not valid: {0}")]
    Labels(String),
    #[error("failed to evaluate selector matchFields: {0}")]
    Fields(#[from] FieldError),
}

/// Selector failure attributed to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} (candidate {index} '{name}')")]
pub struct SelectorMatchError {
    pub index: usize,
    pub name: String,
    pub kind: MatchErrorKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    /// Candidate indices sharing the highest positive score, ascending.
    pub winners: Vec<usize>,
    /// Failures in candidate order. Failing candidates never win.
    pub errors: Vec<SelectorMatchError>,
}

impl MatchReport {
    /// Fail-fast view: the lowest-index error, else the winners.
    pub fn into_result(self) -> Result<Vec<usize>, SelectorMatchError> {
        match self.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(self.winners),
        }
    }
}

/// Score one selector: `Ok(None)` when it does not match, otherwise the
/// number of requirements it satisfied.
pub fn score(query: &dyn PathQuery, selectable: &dyn Selectable, sel: &Selector) -> Result<Option<usize>, MatchErrorKind> {
    let ls = LabelSelector::parse(sel).map_err(MatchErrorKind::Labels)?;
    if !ls.matches(selectable.labels()) {
        return Ok(None);
    }
    if !matches_all_fields(query, &sel.match_fields, selectable.document())? {
        return Ok(None);
    }
    Ok(Some(sel.requirement_count()))
}

/// Winners are all candidates at the high-water mark, which must be above zero.
pub fn best_match<S: SelectingObject>(query: &dyn PathQuery, selectable: &dyn Selectable, candidates: &[S]) -> MatchReport {
    let mut report = MatchReport::default();
    let mut high = 0usize;
    for (idx, cand) in candidates.iter().enumerate() {
        match score(query, selectable, cand.selector()) {
            Ok(Some(s)) if s > 0 => {
                if s > high {
                    high = s;
                    report.winners.clear();
                }
                if s == high {
                    report.winners.push(idx);
                }
            }
            Ok(_) => {}
            Err(kind) => {
                debug!(index = idx, name = %cand.name(), error = %kind, "selector: candidate rejected");
                report.errors.push(SelectorMatchError { index: idx, name: cand.name().to_string(), kind });
            }
        }
    }
    debug!(candidates = candidates.len(), winners = ?report.winners, score = high, "selector: best match");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_eval::JsonPath;

    struct Subject {
        labels: BTreeMap<String, String>,
        doc: Json,
    }

    impl Selectable for Subject {
        fn labels(&self) -> &BTreeMap<String, String> { &self.labels }
        fn document(&self) -> &Json { &self.doc }
    }

    fn opt(labels: &[(&str, &str)]) -> TemplateOption {
        TemplateOption {
            name: "opt".into(),
            selector: Selector { match_labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(), ..Default::default() },
        }
    }

    #[test]
    fn empty_selector_never_wins() {
        let s = Subject { labels: BTreeMap::new(), doc: Json::Null };
        let r = best_match(&JsonPath::new(), &s, &[opt(&[])]);
        assert!(r.winners.is_empty() && r.errors.is_empty());
    }

    #[test]
    fn higher_score_clears_earlier_winners() {
        let s = Subject { labels: [("a", "1"), ("b", "2")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(), doc: Json::Null };
        let r = best_match(&JsonPath::new(), &s, &[opt(&[("a", "1")]), opt(&[("a", "1"), ("b", "2")]), opt(&[("b", "2")])]);
        assert_eq!(r.winners, vec![1]);
    }
}
