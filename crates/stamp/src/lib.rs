//! Kiln stamping: turn a template plus context into a decorated object, and
//! compare it against what is live.

#![forbid(unsafe_code)]

pub mod decorate;
pub mod drift;
pub mod render;
pub mod yaml;

pub use decorate::{content_hash, Stamp};
pub use drift::{diff_summary, has_drift, strip_noisy, DiffSummary};
pub use render::{render, Context, StampError};
pub use yaml::{parse_documents, ManifestError};
