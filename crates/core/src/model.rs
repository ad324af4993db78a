//! Blueprint, template and selector model as consumed from manifests.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Json;

pub type Values = SmallVec<[String; 4]>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("manifest is not valid: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("manifest missing {0}")]
    Missing(&'static str),
}

// ---- selectors ----

/// Label and field selector of a blueprint or a template option.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<FieldSelectorRequirement>,
}

impl Selector {
    pub fn requirement_count(&self) -> usize {
        self.match_labels.len() + self.match_expressions.len() + self.match_fields.len()
    }

    pub fn is_empty(&self) -> bool { self.requirement_count() == 0 }
}

/// Set-based label requirement. The operator is kept verbatim so malformed
/// selectors surface as match errors instead of deserialization failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub values: Values,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelectorRequirement {
    /// Query path evaluated against the subject document.
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub values: Values,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOperator { In, NotIn, Exists, DoesNotExist }

impl FromStr for LabelOperator {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOperator { In, NotIn, Exists, DoesNotExist }

impl FromStr for FieldOperator {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            _ => Err(()),
        }
    }
}

// ---- templates ----

/// Object lifecycle discipline of a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Mutable,
    Immutable,
    Tekton,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Mutable => "mutable",
            Lifecycle::Immutable => "immutable",
            Lifecycle::Tekton => "tekton",
        }
    }

    /// Immutable and tekton objects are never updated, only appended.
    pub fn is_append_only(&self) -> bool { !matches!(self, Lifecycle::Mutable) }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mutable" => Some(Lifecycle::Mutable),
            "immutable" => Some(Lifecycle::Immutable),
            "tekton" => Some(Lifecycle::Tekton),
            _ => None,
        }
    }
}

/// Declarative mapping from status to a health verdict. The first populated
/// field wins, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRule {
    /// Presence-only marker (`alwaysHealthy: {}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_healthy: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_condition_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_match: Option<MultiMatch>,
}

impl HealthRule {
    pub fn always_healthy() -> Self { Self { always_healthy: Some(Json::Object(Default::default())), ..Default::default() } }
    pub fn single_condition_type(t: impl Into<String>) -> Self { Self { single_condition_type: Some(t.into()), ..Default::default() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiMatch {
    #[serde(default)]
    pub healthy: MatchRule,
    #[serde(default)]
    pub unhealthy: MatchRule,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<ConditionRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<FieldSelectorRequirement>,
}

impl MatchRule {
    pub fn is_empty(&self) -> bool { self.match_conditions.is_empty() && self.match_fields.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRequirement {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default)]
    pub default: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Document with `$(...)$` placeholders.
    pub template: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_rule: Option<HealthRule>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub kind: String,
    pub name: String,
    pub spec: TemplateSpec,
}

impl Template {
    pub fn from_manifest(raw: &Json) -> Result<Self, ModelError> {
        let m: Manifest<TemplateSpec> = serde_json::from_value(raw.clone())?;
        let name = m.metadata.name.ok_or(ModelError::Missing("metadata.name"))?;
        Ok(Self { kind: m.kind, name, spec: m.spec })
    }
}

// ---- blueprints ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigWiring {
    /// Upstream resource whose output is consumed.
    pub resource: String,
    /// Input name visible to the template as `configs.<name>`.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOption {
    pub name: String,
    #[serde(default)]
    pub selector: Selector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<TemplateOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintResource {
    pub name: String,
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigWiring>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintSpec {
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub resources: Vec<BlueprintResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    pub spec: BlueprintSpec,
}

impl Blueprint {
    pub fn from_manifest(raw: &Json) -> Result<Self, ModelError> {
        let m: Manifest<BlueprintSpec> = serde_json::from_value(raw.clone())?;
        let name = m.metadata.name.ok_or(ModelError::Missing("metadata.name"))?;
        Ok(Self { name, spec: m.spec })
    }
}

#[derive(Deserialize)]
struct Manifest<S> {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ManifestMeta,
    spec: S,
}

#[derive(Default, Deserialize)]
struct ManifestMeta {
    name: Option<String>,
}
