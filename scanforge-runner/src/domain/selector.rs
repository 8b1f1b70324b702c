//! Template selectors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which templates a scan should use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplateSelector {
    /// The scanner's full default corpus.
    All,
    /// A list of template directory names (e.g. `["cves/", "http/"]`).
    Dirs(Vec<String>),
    /// A single template file beneath the library's upload area.
    File(PathBuf),
}

impl TemplateSelector {
    /// Render into repeated `-t` scanner arguments. `All` passes nothing
    /// and lets the scanner use its default corpus.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            TemplateSelector::All => Vec::new(),
            TemplateSelector::Dirs(dirs) => dirs
                .iter()
                .flat_map(|dir| ["-t".to_string(), dir.clone()])
                .collect(),
            TemplateSelector::File(path) => {
                vec!["-t".to_string(), path.display().to_string()]
            }
        }
    }

    /// Human-readable summary for logs and job records.
    pub fn describe(&self) -> String {
        match self {
            TemplateSelector::All => "all".to_string(),
            TemplateSelector::Dirs(dirs) => dirs.join(","),
            TemplateSelector::File(path) => path.display().to_string(),
        }
    }
}
