//! CVE feed client.
//!
//! Talks to an NVD-shaped JSON endpoint with a date cursor. The feed is
//! a collaborator; everything beyond "give me the records published in
//! this window" stays out of scope.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::domain::cve::CveRecord;

/// Feed errors.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Network(String),
    #[error("feed request timed out after {0}s")]
    Timeout(u64),
    #[error("feed returned an unexpected payload: {0}")]
    InvalidPayload(String),
}

/// Client for a date-cursored CVE feed.
pub struct CveFeedClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CveFeedClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build feed HTTP client with custom timeout, using default client");
                Client::new()
            });
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Fetch records published inside `[start, end]`, deduplicated by id.
    pub async fn fetch_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CveRecord>, FeedError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("pubStartDate", start.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
                ("pubEndDate", end.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FeedError::Timeout(self.timeout.as_secs())
                } else {
                    FeedError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Network(format!("feed returned {status}")));
        }

        let feed: FeedResponse = response
            .json()
            .await
            .map_err(|e| FeedError::InvalidPayload(e.to_string()))?;

        let mut seen = HashSet::new();
        let records: Vec<CveRecord> = feed
            .vulnerabilities
            .into_iter()
            .filter_map(|entry| entry.cve)
            .filter_map(|cve| {
                let id = cve.id?;
                if !seen.insert(id.clone()) {
                    debug!(cve_id = %id, "Duplicate record in feed response");
                    return None;
                }
                let description = cve
                    .descriptions
                    .iter()
                    .find(|d| d.lang.as_deref() == Some("en"))
                    .or_else(|| cve.descriptions.first())
                    .map(|d| d.value.clone())
                    .unwrap_or_default();
                Some(CveRecord {
                    cve_id: id,
                    published_at: cve.published,
                    description,
                    references: cve.references.into_iter().filter_map(|r| r.url).collect(),
                })
            })
            .collect();

        info!(count = records.len(), "Fetched CVE records from feed");
        Ok(records)
    }
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(default)]
    vulnerabilities: Vec<FeedEntry>,
}

#[derive(Deserialize)]
struct FeedEntry {
    cve: Option<FeedCve>,
}

#[derive(Deserialize)]
struct FeedCve {
    id: Option<String>,
    published: Option<DateTime<Utc>>,
    #[serde(default)]
    descriptions: Vec<FeedDescription>,
    #[serde(default)]
    references: Vec<FeedReference>,
}

#[derive(Deserialize)]
struct FeedDescription {
    lang: Option<String>,
    value: String,
}

#[derive(Deserialize)]
struct FeedReference {
    url: Option<String>,
}
