//! Detection templates.
//!
//! A template is a YAML document the scanner consumes. Structural
//! validation enforces the minimum contract: an `id`, `info.name`,
//! `info.severity`, and at least one request block carrying matchers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use scanforge_core::domain::Severity;

/// Where a template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOrigin {
    Curated,
    AiGenerated,
    AiRefined,
    UserUploaded,
}

/// Validation lifecycle of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Unvalidated,
    Validating,
    Valid,
    InvalidMaxRetries,
}

/// A template with its library metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub cve_id: Option<String>,
    pub filename: String,
    pub body: String,
    pub origin: TemplateOrigin,
    /// 0 for the original generation; counts refinements after that.
    pub generation_attempt: u32,
    pub validation_state: ValidationState,
}

/// Parsed view of the fields validation cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDoc {
    pub id: String,
    pub name: String,
    pub severity: Severity,
}

/// Template validation errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template is not valid YAML: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("template is structurally invalid: {0}")]
    Structure(String),
}

/// Request-section keys the scanner understands.
const REQUEST_SECTIONS: [&str; 6] = ["http", "requests", "network", "tcp", "dns", "headless"];

/// Validate a template body and extract the identifying fields.
pub fn validate_structure(body: &str) -> Result<TemplateDoc, TemplateError> {
    let doc: serde_yml::Value = serde_yml::from_str(body)?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| TemplateError::Structure("template must be a YAML mapping".into()))?;

    let id = mapping
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| TemplateError::Structure("template must have a string `id`".into()))?
        .to_string();

    let info = mapping
        .get("info")
        .and_then(|v| v.as_mapping())
        .ok_or_else(|| TemplateError::Structure("template must have an `info` mapping".into()))?;
    let name = info
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| TemplateError::Structure("info must have a `name`".into()))?
        .to_string();
    let raw_severity = info
        .get("severity")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TemplateError::Structure("info must have a `severity`".into()))?;
    let (severity, _) = Severity::normalize(raw_severity);

    let requests = REQUEST_SECTIONS
        .iter()
        .find_map(|key| mapping.get(*key).and_then(|v| v.as_sequence()))
        .ok_or_else(|| {
            TemplateError::Structure("template must have at least one request section".into())
        })?;
    if requests.is_empty() {
        return Err(TemplateError::Structure("request section is empty".into()));
    }
    let has_matchers = requests.iter().any(|request| {
        request
            .as_mapping()
            .and_then(|m| m.get("matchers"))
            .and_then(|v| v.as_sequence())
            .is_some_and(|matchers| !matchers.is_empty())
    });
    if !has_matchers {
        return Err(TemplateError::Structure(
            "no request block carries matchers".into(),
        ));
    }

    Ok(TemplateDoc { id, name, severity })
}

/// Content-derived template id for uploaded bodies: the same body always
/// yields the same id.
pub fn upload_template_id(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    hex::encode(&digest[..16])
}
