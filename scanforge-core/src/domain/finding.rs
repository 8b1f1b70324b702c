//! Scan findings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::severity::Severity;

/// A single match reported by the scanner during a run.
///
/// `finding_id` is a content digest over the identifying fields so that
/// log replays are idempotent: re-parsing the same stream produces the
/// same ids and duplicates are suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub template_id: String,
    pub protocol: String,
    pub severity: Severity,
    /// Set when the scanner reported a severity outside the known set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unknown_severity: bool,
    pub target: String,
    pub matched_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl Finding {
    pub fn new(
        template_id: impl Into<String>,
        protocol: impl Into<String>,
        severity: Severity,
        target: impl Into<String>,
        matched_at: impl Into<String>,
    ) -> Self {
        let template_id = template_id.into();
        let protocol = protocol.into();
        let target = target.into();
        let matched_at = matched_at.into();
        let finding_id =
            Self::derive_id(&template_id, &protocol, severity, &target, &matched_at);

        Self {
            finding_id,
            template_id,
            protocol,
            severity,
            unknown_severity: false,
            target,
            matched_at,
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn with_unknown_severity(mut self, unknown: bool) -> Self {
        self.unknown_severity = unknown;
        self
    }

    /// Digest of the identifying fields, truncated to 16 bytes of hex.
    pub fn derive_id(
        template_id: &str,
        protocol: &str,
        severity: Severity,
        target: &str,
        matched_at: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(template_id.as_bytes());
        hasher.update(protocol.as_bytes());
        hasher.update(severity.as_str().as_bytes());
        hasher.update(target.as_bytes());
        hasher.update(matched_at.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}
