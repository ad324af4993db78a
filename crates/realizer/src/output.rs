//! Output extraction from the live stamped object.

use kiln_core::condition::reasons;
use kiln_core::{Json, Output, PathQuery, QueryError, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    /// Not populated yet; picked up on a later cycle.
    #[error("no value at path {path}")]
    Missing { path: String },
    #[error("config path {path} is invalid: {reason}")]
    BadPath { path: String, reason: String },
}

impl ExtractError {
    pub fn verdict(&self) -> Verdict {
        match self {
            ExtractError::Missing { .. } => Verdict::unknown(reasons::MISSING_VALUE_AT_PATH, self.to_string()),
            ExtractError::BadPath { .. } => Verdict::failed(reasons::TEMPLATE_STAMP_FAILURE, self.to_string()),
        }
    }
}

pub fn extract(query: &dyn PathQuery, object: &Json, config_path: &str) -> Result<Output, ExtractError> {
    match query.query(object, config_path) {
        Ok(v) => Ok(Output::new(Output::DEFAULT_NAME, v)),
        Err(QueryError::NotFound { .. }) => Err(ExtractError::Missing { path: config_path.to_string() }),
        Err(QueryError::Syntax { reason, .. }) => Err(ExtractError::BadPath { path: config_path.to_string(), reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ConditionStatus;
    use kiln_eval::JsonPath;
    use serde_json::json;

    #[test]
    fn extracts_value_at_config_path() {
        let obj = json!({ "spec": { "foo": "bar" } });
        let out = extract(&JsonPath::new(), &obj, "spec.foo").unwrap();
        assert_eq!(out, Output::new("config", json!("bar")));
    }

    #[test]
    fn missing_value_is_unknown_not_failure() {
        let obj = json!({ "status": {} });
        let err = extract(&JsonPath::new(), &obj, "status.latestImage").unwrap_err();
        let v = err.verdict();
        assert_eq!((v.status, v.reason.as_str()), (ConditionStatus::Unknown, "MissingValueAtPath"));
        assert_eq!(extract(&JsonPath::new(), &obj, "status[").unwrap_err().verdict().status, ConditionStatus::False);
    }
}
