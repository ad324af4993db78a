//! Multi-document YAML manifests.

use kiln_core::Json;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("YAML payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("document {index}: {source}")]
    Parse { index: usize, source: serde_yaml::Error },
    #[error("document {index}: not representable as JSON: {source}")]
    Json { index: usize, source: serde_json::Error },
}

fn max_yaml_bytes() -> usize {
    std::env::var("KILN_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(4_000_000)
}

/// Parse every `---` separated document; empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<Vec<Json>, ManifestError> {
    let max = max_yaml_bytes();
    if text.len() > max {
        return Err(ManifestError::TooLarge(max));
    }
    let mut out = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| ManifestError::Parse { index, source })?;
        if val.is_null() {
            continue;
        }
        out.push(serde_json::to_value(val).map_err(|source| ManifestError::Json { index, source })?);
    }
    Ok(out)
}
