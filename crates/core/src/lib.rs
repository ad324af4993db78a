//! Kiln core types: blueprint/template model, conditions, object keys and the
//! collaborator traits (object store, events, repository, path queries).

#![forbid(unsafe_code)]

pub mod condition;
pub mod model;
pub mod object;
pub mod owner;
pub mod query;
pub mod store;

pub use condition::{Condition, ConditionStatus, HealthState, Verdict};
pub use model::{
    Blueprint, BlueprintResource, BlueprintSpec, ConfigWiring, FieldOperator, FieldSelectorRequirement, ConditionRequirement,
    HealthRule, LabelOperator, LabelSelectorRequirement, Lifecycle, MatchRule, ModelError, MultiMatch,
    Param, Selector, Template, TemplateOption, TemplateParam, TemplateRef, TemplateSpec,
};
pub use object::{ObjectKey, TypeKey};
pub use owner::{BlueprintRef, Output, OutputStatus, Owner, OwnerStatus, ResourceStatus, TemplateIdent};
pub use query::{PathQuery, QueryError};
pub use store::{EventSink, ObjectStore, Repository, StampEvent, StoreError, Trigger};

pub mod prelude {
    pub use super::{
        Blueprint, Condition, ConditionStatus, HealthState, ObjectKey, ObjectStore, Output, Owner, PathQuery,
        Repository, Selector, StoreError, Template, TypeKey, Verdict,
    };
}

/// Raw JSON document type used for owners and stamped objects.
pub type Json = serde_json::Value;
