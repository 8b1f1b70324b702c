//! Shared response parsing utilities for LLM outputs
//!
//! Models asked for a YAML document routinely wrap it in markdown fences
//! or surround it with narrative text. This extracts the first usable
//! YAML block.

use serde::de::DeserializeOwned;

use crate::domain::LlmError;

/// Utilities for extracting and parsing YAML from LLM responses.
pub struct ResponseParser;

impl ResponseParser {
    /// Parse a YAML value from an LLM response.
    ///
    /// Strategy order:
    /// 1) Extract a fenced YAML code block (```yaml ... ```).
    /// 2) Extract any fenced code block (``` ... ```).
    /// 3) Fall back to the full trimmed content.
    pub fn parse_yaml<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
        let candidate = Self::extract_yaml(content);
        serde_yml::from_str::<T>(&candidate).map_err(|e| {
            LlmError::InvalidResponse(format!("failed to parse YAML from response: {}", e))
        })
    }

    /// Extract the most plausible YAML document from a response.
    pub fn extract_yaml(content: &str) -> String {
        let trimmed = content.trim();

        if let Some(block) = Self::extract_fenced_block(trimmed, Some("yaml"))
            .or_else(|| Self::extract_fenced_block(trimmed, Some("yml")))
            .or_else(|| Self::extract_fenced_block(trimmed, None))
        {
            return block;
        }

        // Fence markers without a closing fence still need stripping
        let mut cleaned = trimmed;
        for prefix in ["```yaml", "```yml", "```"] {
            if let Some(rest) = cleaned.strip_prefix(prefix) {
                cleaned = rest.trim_start();
                break;
            }
        }
        cleaned.strip_suffix("```").unwrap_or(cleaned).trim().to_string()
    }

    fn extract_fenced_block(content: &str, language: Option<&str>) -> Option<String> {
        let fence = "```";
        let mut search = content;

        loop {
            let start = search.find(fence)?;
            let after_start = &search[start + fence.len()..];

            // Determine language tag
            let (lang_tag, rest) = if let Some(line_end) = after_start.find('\n') {
                let tag = after_start[..line_end].trim();
                (tag, &after_start[line_end + 1..])
            } else {
                return None;
            };

            if let Some(expected) = language {
                if !lang_tag.eq_ignore_ascii_case(expected) {
                    // Continue scanning after this fence
                    search = after_start;
                    continue;
                }
            }

            let end = rest.find(fence)?;
            let block = rest[..end].trim().to_string();
            return Some(block);
        }
    }
}
