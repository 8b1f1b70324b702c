//! CVE records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A public vulnerability record from the CVE feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveRecord {
    pub cve_id: String,
    pub published_at: Option<DateTime<Utc>>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl CveRecord {
    /// Cache key under which this record is stored.
    pub fn cache_key(cve_id: &str) -> String {
        format!("cve:{cve_id}")
    }
}
