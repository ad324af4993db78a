//! Path query seam. Field selectors, config paths and health rules all read
//! documents through this trait.

use crate::Json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The path is well formed but does not resolve in this document.
    #[error("no value at {path}")]
    NotFound { path: String },
    #[error("invalid path {path}: {reason}")]
    Syntax { path: String, reason: String },
}

impl QueryError {
    pub fn is_not_found(&self) -> bool { matches!(self, QueryError::NotFound { .. }) }
}

pub trait PathQuery: Send + Sync {
    fn query(&self, doc: &Json, path: &str) -> Result<Json, QueryError>;
}
