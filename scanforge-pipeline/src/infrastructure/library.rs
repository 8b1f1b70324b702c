//! Template library.
//!
//! Filesystem-backed store for detection templates. Writers go through
//! write-to-temp + rename so readers never observe a partial file; the
//! in-memory index is rebuilt from the tree on startup and kept
//! consistent with writes.
//!
//! Layout under the library root:
//!   `{category}/{name}.yaml`   curated corpus
//!   `ai/{cve_id}.yaml`         generated templates
//!   `ai/{cve_id}.r{n}.yaml`    refinement `n`
//!   `custom/{id}.yaml`         uploads and ad-hoc templates

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::template::{
    Template, TemplateOrigin, ValidationState, upload_template_id, validate_structure,
};

/// Library errors.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("library io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Invalid(#[from] crate::domain::template::TemplateError),
}

#[derive(Debug, Clone)]
struct IndexEntry {
    /// Path relative to the library root.
    path: PathBuf,
    cve_id: Option<String>,
    origin: TemplateOrigin,
    generation_attempt: u32,
    validation_state: ValidationState,
}

/// Filesystem template library with an in-memory index.
pub struct TemplateLibrary {
    root: PathBuf,
    index: RwLock<HashMap<String, IndexEntry>>,
}

impl TemplateLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the expected directory layout.
    pub async fn ensure_layout(&self) -> Result<(), LibraryError> {
        for dir in ["ai", "custom"] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    /// Rebuild the index from the filesystem. Validation states reset to
    /// `Unvalidated`; the pipeline re-validates what it cares about.
    pub fn rebuild_index(&self) -> Result<usize, LibraryError> {
        let mut fresh = HashMap::new();

        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_path_buf();

            let body = match std::fs::read_to_string(path) {
                Ok(body) => body,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable template");
                    continue;
                }
            };

            let (template_id, cve_id, origin, generation_attempt) =
                match Self::classify(&relative, &body) {
                    Some(parts) => parts,
                    None => {
                        warn!(path = %relative.display(), "Skipping unidentifiable template");
                        continue;
                    }
                };

            fresh.insert(
                template_id,
                IndexEntry {
                    path: relative,
                    cve_id,
                    origin,
                    generation_attempt,
                    validation_state: ValidationState::Unvalidated,
                },
            );
        }

        let count = fresh.len();
        *self.index.write().expect("library index lock poisoned") = fresh;
        info!(count, root = %self.root.display(), "Template library index rebuilt");
        Ok(count)
    }

    /// Derive (template_id, cve_id, origin, attempt) from a path and body.
    fn classify(
        relative: &Path,
        body: &str,
    ) -> Option<(String, Option<String>, TemplateOrigin, u32)> {
        let stem = relative.file_stem()?.to_str()?;
        let top = relative.iter().next()?.to_str()?;

        match top {
            "ai" => {
                // `{cve}.yaml` or `{cve}.r{n}.yaml`
                let (cve, attempt) = match stem.rsplit_once(".r") {
                    Some((cve, n)) => (cve.to_string(), n.parse().ok()?),
                    None => (stem.to_string(), 0),
                };
                let origin = if attempt > 0 {
                    TemplateOrigin::AiRefined
                } else {
                    TemplateOrigin::AiGenerated
                };
                let template_id = validate_structure(body)
                    .map(|doc| doc.id)
                    .unwrap_or_else(|_| cve.clone());
                Some((template_id, Some(cve), origin, attempt))
            }
            "custom" => match stem.strip_prefix("ai-") {
                Some(digest) => Some((digest.to_string(), None, TemplateOrigin::AiGenerated, 0)),
                None => Some((stem.to_string(), None, TemplateOrigin::UserUploaded, 0)),
            },
            _ => {
                let doc = validate_structure(body).ok()?;
                Some((doc.id, None, TemplateOrigin::Curated, 0))
            }
        }
    }

    /// Atomic write: temp file in the destination directory, then rename.
    async fn write_atomic(&self, relative: &Path, body: &str) -> Result<(), LibraryError> {
        let destination = self.root.join(relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = destination.with_extension("yaml.tmp");
        tokio::fs::write(&temp, body.as_bytes()).await?;
        tokio::fs::rename(&temp, &destination).await?;
        debug!(path = %destination.display(), "Template written");
        Ok(())
    }

    fn insert_index(&self, template: &Template, relative: PathBuf) {
        self.index
            .write()
            .expect("library index lock poisoned")
            .insert(
                template.template_id.clone(),
                IndexEntry {
                    path: relative,
                    cve_id: template.cve_id.clone(),
                    origin: template.origin,
                    generation_attempt: template.generation_attempt,
                    validation_state: template.validation_state,
                },
            );
    }

    /// Store a generated (or refined) template for a CVE. Attempt 0 lands
    /// at `ai/{cve}.yaml`, refinement `n` at `ai/{cve}.r{n}.yaml`.
    pub async fn store_generated(
        &self,
        cve_id: &str,
        body: &str,
        attempt: u32,
    ) -> Result<Template, LibraryError> {
        let doc = validate_structure(body)?;
        let filename = if attempt == 0 {
            format!("{cve_id}.yaml")
        } else {
            format!("{cve_id}.r{attempt}.yaml")
        };
        let relative = PathBuf::from("ai").join(&filename);
        self.write_atomic(&relative, body).await?;

        let template = Template {
            template_id: doc.id,
            cve_id: Some(cve_id.to_string()),
            filename,
            body: body.to_string(),
            origin: if attempt == 0 {
                TemplateOrigin::AiGenerated
            } else {
                TemplateOrigin::AiRefined
            },
            generation_attempt: attempt,
            validation_state: ValidationState::Unvalidated,
        };
        self.insert_index(&template, relative);
        Ok(template)
    }

    /// Store an uploaded template. The id is a digest of the body, so
    /// re-uploading identical bytes is a no-op returning the same id.
    pub async fn store_upload(
        &self,
        body: &str,
        original_filename: &str,
    ) -> Result<Template, LibraryError> {
        validate_structure(body)?;
        let template_id = upload_template_id(body);
        let relative = PathBuf::from("custom").join(format!("{template_id}.yaml"));
        self.write_atomic(&relative, body).await?;

        let template = Template {
            template_id,
            cve_id: None,
            filename: original_filename.to_string(),
            body: body.to_string(),
            origin: TemplateOrigin::UserUploaded,
            generation_attempt: 0,
            validation_state: ValidationState::Unvalidated,
        };
        self.insert_index(&template, relative);
        Ok(template)
    }

    /// Store a template synthesized ad hoc from a natural-language scan
    /// request. Lives with the uploads but keeps its AI origin.
    pub async fn store_ad_hoc(&self, body: &str) -> Result<Template, LibraryError> {
        validate_structure(body)?;
        let template_id = upload_template_id(body);
        let filename = format!("ai-{template_id}.yaml");
        let relative = PathBuf::from("custom").join(&filename);
        self.write_atomic(&relative, body).await?;

        let template = Template {
            template_id,
            cve_id: None,
            filename,
            body: body.to_string(),
            origin: TemplateOrigin::AiGenerated,
            generation_attempt: 0,
            validation_state: ValidationState::Unvalidated,
        };
        self.insert_index(&template, relative);
        Ok(template)
    }

    /// Library-relative path for a template id (what a scan selector
    /// references).
    pub fn relative_path(&self, template_id: &str) -> Result<PathBuf, LibraryError> {
        self.index
            .read()
            .expect("library index lock poisoned")
            .get(template_id)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| LibraryError::NotFound(template_id.to_string()))
    }

    /// Load a template with its body.
    pub async fn get(&self, template_id: &str) -> Result<Template, LibraryError> {
        let entry = {
            self.index
                .read()
                .expect("library index lock poisoned")
                .get(template_id)
                .cloned()
                .ok_or_else(|| LibraryError::NotFound(template_id.to_string()))?
        };
        let body = tokio::fs::read_to_string(self.root.join(&entry.path)).await?;
        Ok(Template {
            template_id: template_id.to_string(),
            cve_id: entry.cve_id,
            filename: entry
                .path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            body,
            origin: entry.origin,
            generation_attempt: entry.generation_attempt,
            validation_state: entry.validation_state,
        })
    }

    /// Update a template's validation state. A `Valid` template is
    /// immutable from then on; callers must not re-store it.
    pub fn set_validation_state(
        &self,
        template_id: &str,
        state: ValidationState,
    ) -> Result<(), LibraryError> {
        let mut index = self.index.write().expect("library index lock poisoned");
        let entry = index
            .get_mut(template_id)
            .ok_or_else(|| LibraryError::NotFound(template_id.to_string()))?;
        entry.validation_state = state;
        Ok(())
    }

    pub fn validation_state(&self, template_id: &str) -> Result<ValidationState, LibraryError> {
        self.index
            .read()
            .expect("library index lock poisoned")
            .get(template_id)
            .map(|entry| entry.validation_state)
            .ok_or_else(|| LibraryError::NotFound(template_id.to_string()))
    }

    /// Template ids in the active library (everything except templates
    /// that exhausted their refinement budget).
    pub fn active_ids(&self) -> Vec<String> {
        self.index
            .read()
            .expect("library index lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.validation_state != ValidationState::InvalidMaxRetries)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().expect("library index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
