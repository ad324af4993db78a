//! Field requirement evaluation over a queryable document.

use kiln_core::{FieldOperator, FieldSelectorRequirement, Json, PathQuery, QueryError};
use kiln_eval::scalar_string;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unable to match field requirement with key [{key}] operator [{operator}] values [{values:?}]: {cause}")]
pub struct FieldError {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
    pub cause: FieldErrorCause,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldErrorCause {
    #[error("{0}")]
    Query(QueryError),
    #[error("unsupported operator")]
    Operator,
}

impl FieldError {
    fn new(req: &FieldSelectorRequirement, cause: FieldErrorCause) -> Self {
        Self { key: req.key.clone(), operator: req.operator.clone(), values: req.values.to_vec(), cause }
    }
}

/// Evaluate one requirement. A path that does not resolve is a non-match for
/// `In`, `NotIn` and `Exists` and a match for `DoesNotExist`.
pub fn matches(query: &dyn PathQuery, req: &FieldSelectorRequirement, subject: &Json) -> Result<bool, FieldError> {
    let op: FieldOperator = req.operator.parse().map_err(|_| FieldError::new(req, FieldErrorCause::Operator))?;
    let found = match query.query(subject, &req.key) {
        Ok(v) => Some(v),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(FieldError::new(req, FieldErrorCause::Query(e))),
    };
    let Some(value) = found else {
        return Ok(matches!(op, FieldOperator::DoesNotExist));
    };
    let rendered = scalar_string(&value).unwrap_or_else(|| value.to_string());
    Ok(match op {
        FieldOperator::In => req.values.iter().any(|v| *v == rendered),
        FieldOperator::NotIn => !req.values.iter().any(|v| *v == rendered),
        FieldOperator::Exists => true,
        FieldOperator::DoesNotExist => false,
    })
}

/// True only when every requirement matches; stops at the first miss or error.
pub fn matches_all_fields(query: &dyn PathQuery, reqs: &[FieldSelectorRequirement], subject: &Json) -> Result<bool, FieldError> {
    for req in reqs {
        if !matches(query, req, subject)? {
            return Ok(false);
        }
    }
    Ok(true)
}
