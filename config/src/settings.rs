use std::fs;
use std::io;
use std::path::Path;

use crag_types::{FileIndex, ReasoningEffort};
use crag_utils::{atomic_write, recover_bak_file};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Index settings file, relative to the working directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Persisted index state: which store the corpus lives in, which patterns
/// define the corpus, and per-path change-detection metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(
        default,
        rename = "vector_store_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub knowledge_store_id: Option<String>,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub indexed_files: FileIndex,
}

impl Settings {
    /// Load settings from `path`. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        recover_bak_file(path);
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::ParseSettings {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)?;
        atomic_write(path, &json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            files = self.indexed_files.len(),
            "Saved index settings"
        );
        Ok(())
    }

    /// Forget the current store and every indexed file.
    pub fn clear_index(&mut self) {
        self.knowledge_store_id = None;
        self.indexed_files.clear();
    }
}
