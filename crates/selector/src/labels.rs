//! Set-based label selectors with Kubernetes validation rules.

use std::collections::BTreeMap;

use kiln_core::{LabelOperator, Selector};
use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex"));
static DNS1123_SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex"));

const NAME_MAX: usize = 63;
const PREFIX_MAX: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement<'a> {
    key: &'a str,
    op: LabelOperator,
    values: SmallVec<[&'a str; 4]>,
}

impl Requirement<'_> {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let got = labels.get(self.key).map(String::as_str);
        match self.op {
            LabelOperator::In => got.map(|v| self.values.contains(&v)).unwrap_or(false),
            LabelOperator::NotIn => got.map(|v| !self.values.contains(&v)).unwrap_or(true),
            LabelOperator::Exists => got.is_some(),
            LabelOperator::DoesNotExist => got.is_none(),
        }
    }
}

/// Validated label half of a [`Selector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector<'a> {
    reqs: Vec<Requirement<'a>>,
}

impl<'a> LabelSelector<'a> {
    /// Validate `matchLabels` and `matchExpressions`; the error text follows
    /// the API server's field validation messages.
    pub fn parse(sel: &'a Selector) -> Result<Self, String> {
        let mut reqs = Vec::with_capacity(sel.match_labels.len() + sel.match_expressions.len());
        for (k, v) in sel.match_labels.iter() {
            validate_key(k)?;
            validate_value(v, 0)?;
            reqs.push(Requirement { key: k, op: LabelOperator::In, values: SmallVec::from_slice(&[v.as_str()]) });
        }
        for expr in sel.match_expressions.iter() {
            let op: LabelOperator = expr
                .operator
                .parse()
                .map_err(|_| format!("\"{}\" is not a valid label selector operator", expr.operator))?;
            validate_key(&expr.key)?;
            match op {
                LabelOperator::In | LabelOperator::NotIn if expr.values.is_empty() => {
                    return Err("values: Invalid value: []: for 'in', 'notin' operators, values set can't be empty".to_string());
                }
                LabelOperator::Exists | LabelOperator::DoesNotExist if !expr.values.is_empty() => {
                    return Err(format!(
                        "values: Invalid value: {:?}: values set must be empty for exists and does not exist",
                        expr.values.as_slice()
                    ));
                }
                _ => {}
            }
            for (i, v) in expr.values.iter().enumerate() {
                validate_value(v, i)?;
            }
            reqs.push(Requirement { key: &expr.key, op, values: expr.values.iter().map(String::as_str).collect() });
        }
        Ok(Self { reqs })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.reqs.iter().all(|r| r.matches(labels)) }

    pub fn len(&self) -> usize { self.reqs.len() }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }
}

/// Qualified name: optional DNS subdomain prefix, `/`, then a name part.
pub fn validate_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > PREFIX_MAX || !DNS1123_SUBDOMAIN_RE.is_match(p) {
            return Err(format!(
                "key: Invalid value: \"{}\": prefix part must be a lowercase RFC 1123 subdomain of at most {} characters",
                key, PREFIX_MAX
            ));
        }
    }
    if name.is_empty() || name.len() > NAME_MAX || !NAME_RE.is_match(name) {
        return Err(format!(
            "key: Invalid value: \"{}\": name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character (at most {} characters)",
            key, NAME_MAX
        ));
    }
    Ok(())
}

/// Label value: empty, or a name part of at most 63 characters.
pub fn validate_value(value: &str, index: usize) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > NAME_MAX || !NAME_RE.is_match(value) {
        return Err(format!(
            "values[{}]: Invalid value: \"{}\": a valid label must be an empty string or consist of alphanumeric \
             characters, '-', '_' or '.', and must start and end with an alphanumeric character",
            index, value
        ));
    }
    Ok(())
}
