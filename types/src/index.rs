//! Change-detection metadata for the local corpus.
//!
//! The local "index" is not a storage engine: it only remembers, per path,
//! which remote file holds the uploaded copy and what the file looked like
//! when it was uploaded.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-path metadata for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Remote file id. Never empty once the record exists.
    #[serde(rename = "file_id")]
    pub remote_file_id: String,
    /// Modification time in epoch seconds.
    pub last_modified: i64,
    /// Hex content digest. Empty for records written before hashing existed,
    /// or for files too large to hash.
    #[serde(default)]
    pub content_hash: String,
}

impl FileRecord {
    #[must_use]
    pub fn new(
        remote_file_id: impl Into<String>,
        last_modified: i64,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            remote_file_id: remote_file_id.into(),
            last_modified,
            content_hash: content_hash.into(),
        }
    }
}

/// Path-keyed metadata map. Ordered so persisted output and diffs are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIndex {
    records: BTreeMap<PathBuf, FileRecord>,
}

impl FileIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut FileRecord> {
        self.records.get_mut(path)
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.records.contains_key(path)
    }

    pub fn insert(&mut self, path: PathBuf, record: FileRecord) -> Option<FileRecord> {
        self.records.insert(path, record)
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileRecord> {
        self.records.remove(path)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, PathBuf, FileRecord> {
        self.records.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.records.keys().map(PathBuf::as_path)
    }
}

impl<'a> IntoIterator for &'a FileIndex {
    type Item = (&'a PathBuf, &'a FileRecord);
    type IntoIter = btree_map::Iter<'a, PathBuf, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<(PathBuf, FileRecord)> for FileIndex {
    fn from_iter<I: IntoIterator<Item = (PathBuf, FileRecord)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Result of comparing the current file list against a [`FileIndex`].
///
/// A path appears in at most one list. Unchanged paths appear in none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl FileDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Processing state of a remote "add files" batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}
