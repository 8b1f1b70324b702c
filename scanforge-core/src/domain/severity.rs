//! Finding severity levels and normalization.

use serde::{Deserialize, Serialize};

/// Severity of a scanner finding, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Normalize a raw severity token from scanner output.
    ///
    /// `info` maps to `informational`; unknown tokens fall back to
    /// `informational` with the second tuple element set.
    pub fn normalize(raw: &str) -> (Severity, bool) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => (Severity::Informational, false),
            "low" => (Severity::Low, false),
            "medium" => (Severity::Medium, false),
            "high" => (Severity::High, false),
            "critical" => (Severity::Critical, false),
            _ => (Severity::Informational, true),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Informational => "informational",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
