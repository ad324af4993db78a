//! `$(...)$` placeholder substitution.
//!
//! A string that is exactly one placeholder is replaced by the referenced JSON
//! value (so numbers and objects keep their type); any other string has each
//! placeholder interpolated as text.

use std::collections::BTreeMap;

use kiln_core::{Json, PathQuery, QueryError};
use kiln_eval::scalar_string;

const OPEN: &str = "$(";
const CLOSE: &str = ")$";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StampError {
    #[error("owner has no value at {path}")]
    MissingOwnerField { path: String },
    #[error("param {name} is not defined")]
    MissingParam { name: String },
    #[error("param {name} has no value at {path}")]
    MissingParamField { name: String, path: String },
    #[error("config input {name} is not wired to this resource")]
    UnknownConfig { name: String },
    #[error("config input {name} has no output yet")]
    MissingUpstreamOutput { name: String },
    #[error("$(config)$ needs exactly one config input, found {found}")]
    AmbiguousConfig { found: usize },
    #[error("unknown placeholder {expr}")]
    UnknownPlaceholder { expr: String },
    #[error("unterminated placeholder in {text:?}")]
    Unterminated { text: String },
    #[error("bad path in placeholder {expr}: {source}")]
    Query { expr: String, source: QueryError },
}

impl StampError {
    /// Upstream outputs appear later; every other failure needs a template fix.
    pub fn is_missing_upstream(&self) -> bool { matches!(self, StampError::MissingUpstreamOutput { .. }) }
}

/// Values visible to a template.
#[derive(Debug, Clone, Default)]
pub struct Context<'a> {
    pub owner: Option<&'a Json>,
    pub params: BTreeMap<String, Json>,
    /// Wired config inputs; `None` until the upstream resource has an output.
    pub configs: BTreeMap<String, Option<Json>>,
}

pub fn render(query: &dyn PathQuery, template: &Json, ctx: &Context<'_>) -> Result<Json, StampError> {
    match template {
        Json::String(s) => render_str(query, s, ctx),
        Json::Array(items) => items.iter().map(|v| render(query, v, ctx)).collect::<Result<Vec<_>, _>>().map(Json::Array),
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map.iter() {
                out.insert(k.clone(), render(query, v, ctx)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(query: &dyn PathQuery, s: &str, ctx: &Context<'_>) -> Result<Json, StampError> {
    if !s.contains(OPEN) {
        return Ok(Json::String(s.to_string()));
    }
    if let Some(inner) = s.strip_prefix(OPEN).and_then(|r| r.strip_suffix(CLOSE)) {
        if !inner.contains(CLOSE) {
            return resolve(query, inner.trim(), ctx);
        }
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| StampError::Unterminated { text: s.to_string() })?;
        let v = resolve(query, after[..end].trim(), ctx)?;
        out.push_str(&scalar_string(&v).unwrap_or_else(|| v.to_string()));
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Json::String(out))
}

fn resolve(query: &dyn PathQuery, expr: &str, ctx: &Context<'_>) -> Result<Json, StampError> {
    let (root, rest) = match expr.split_once('.') {
        Some((r, p)) => (r, Some(p)),
        None => (expr, None),
    };
    match root {
        "owner" | "workload" => {
            let path = rest.ok_or_else(|| StampError::UnknownPlaceholder { expr: expr.to_string() })?;
            let doc = ctx.owner.ok_or_else(|| StampError::MissingOwnerField { path: path.to_string() })?;
            query.query(doc, path).map_err(|e| match e {
                QueryError::NotFound { .. } => StampError::MissingOwnerField { path: path.to_string() },
                e => StampError::Query { expr: expr.to_string(), source: e },
            })
        }
        "params" => {
            let (name, sub) = split_name(rest, expr)?;
            let v = ctx.params.get(name).ok_or_else(|| StampError::MissingParam { name: name.to_string() })?;
            descend(query, v, sub, expr, |path| StampError::MissingParamField { name: name.to_string(), path })
        }
        "configs" => {
            let (name, sub) = split_name(rest, expr)?;
            let v = config_value(ctx, name)?;
            descend(query, v, sub, expr, |_| StampError::MissingUpstreamOutput { name: name.to_string() })
        }
        "config" => {
            if ctx.configs.len() != 1 {
                return Err(StampError::AmbiguousConfig { found: ctx.configs.len() });
            }
            let (name, _) = ctx.configs.iter().next().ok_or(StampError::AmbiguousConfig { found: 0 })?;
            let v = config_value(ctx, name)?;
            descend(query, v, rest, expr, |_| StampError::MissingUpstreamOutput { name: name.clone() })
        }
        _ => Err(StampError::UnknownPlaceholder { expr: expr.to_string() }),
    }
}

fn split_name<'a>(rest: Option<&'a str>, expr: &str) -> Result<(&'a str, Option<&'a str>), StampError> {
    let rest = rest.filter(|r| !r.is_empty()).ok_or_else(|| StampError::UnknownPlaceholder { expr: expr.to_string() })?;
    Ok(match rest.split_once('.') {
        Some((n, p)) => (n, Some(p)),
        None => (rest, None),
    })
}

fn config_value<'c>(ctx: &'c Context<'_>, name: &str) -> Result<&'c Json, StampError> {
    match ctx.configs.get(name) {
        None => Err(StampError::UnknownConfig { name: name.to_string() }),
        Some(None) => Err(StampError::MissingUpstreamOutput { name: name.to_string() }),
        Some(Some(v)) => Ok(v),
    }
}

fn descend(
    query: &dyn PathQuery,
    v: &Json,
    sub: Option<&str>,
    expr: &str,
    missing: impl FnOnce(String) -> StampError,
) -> Result<Json, StampError> {
    match sub {
        None => Ok(v.clone()),
        Some(path) => query.query(v, path).map_err(|e| match e {
            QueryError::NotFound { .. } => missing(path.to_string()),
            e => StampError::Query { expr: expr.to_string(), source: e },
        }),
    }
}
