//! Change detection against the persisted file index.
//!
//! Modification time is the fast filter; the content hash is the authority.
//! A touched-but-identical file only has its stored mtime refreshed.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crag_types::{FileDiff, FileIndex, FileRecord};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

const HASH_CHUNK_BYTES: usize = 8 * 1024;

/// 64-bit xxh3 digest of the file contents, as 16 lowercase hex digits.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:016x}", hasher.digest()))
}

/// Modification time in epoch seconds, `None` when the file cannot be stat'ed.
#[must_use]
pub fn modified_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    })
}

/// Fingerprint a file for a fresh index record.
pub fn fingerprint(path: &Path, remote_file_id: &str, max_hash_bytes: Option<u64>) -> FileRecord {
    let last_modified = modified_secs(path).unwrap_or_default();
    let hash = if exceeds_limit(path, max_hash_bytes) {
        String::new()
    } else {
        content_hash(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Failed to hash uploaded file");
            String::new()
        })
    };
    FileRecord::new(remote_file_id, last_modified, hash)
}

fn exceeds_limit(path: &Path, max_hash_bytes: Option<u64>) -> bool {
    let Some(limit) = max_hash_bytes else {
        return false;
    };
    fs::metadata(path).is_ok_and(|meta| meta.len() > limit)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeDetector {
    max_hash_bytes: Option<u64>,
}

impl ChangeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files larger than `limit` bytes are never hashed; an mtime change alone
    /// classifies them as modified.
    #[must_use]
    pub fn with_max_hash_bytes(mut self, limit: Option<u64>) -> Self {
        self.max_hash_bytes = limit;
        self
    }

    #[must_use]
    pub fn max_hash_bytes(&self) -> Option<u64> {
        self.max_hash_bytes
    }

    /// Compare `current` against `index`.
    ///
    /// Every path lands in at most one list. Records of modified files are left
    /// untouched here; the caller rewrites them after a successful transfer.
    pub fn diff(&self, current: &[PathBuf], index: &mut FileIndex) -> FileDiff {
        let mut diff = FileDiff::default();
        let mut seen: HashSet<&Path> = HashSet::with_capacity(current.len());

        for path in current {
            if !seen.insert(path.as_path()) {
                continue;
            }
            let Some(record) = index.get_mut(path) else {
                diff.added.push(path.clone());
                continue;
            };

            // An unreadable file never matches, so it is re-examined every scan.
            let mtime = modified_secs(path);
            if mtime == Some(record.last_modified) {
                continue;
            }

            if exceeds_limit(path, self.max_hash_bytes) {
                debug!(path = %path.display(), "Skipping hash of oversized file");
                diff.modified.push(path.clone());
                continue;
            }

            match content_hash(path) {
                Ok(hash) if record.content_hash.is_empty() || hash != record.content_hash => {
                    diff.modified.push(path.clone());
                }
                Ok(_) => {
                    if let Some(mtime) = mtime {
                        debug!(path = %path.display(), "Content unchanged; refreshing mtime");
                        record.last_modified = mtime;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to hash file; will retry next scan");
                }
            }
        }

        diff.removed = index
            .paths()
            .filter(|path| !seen.contains(path))
            .map(Path::to_path_buf)
            .collect();
        diff
    }
}

#[cfg(test)]
mod tests {
    use std::slice;
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;

    fn set_mtime(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", "same bytes");
        let b = write(&dir, "b.txt", "same bytes");
        let c = write(&dir, "c.txt", "diff bytes");

        let hash_a = content_hash(&a).unwrap();
        assert_eq!(hash_a.len(), 16);
        assert_eq!(hash_a, content_hash(&a).unwrap());
        assert_eq!(hash_a, content_hash(&b).unwrap());
        assert_ne!(hash_a, content_hash(&c).unwrap());
    }

    #[test]
    fn classifies_added_modified_removed() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.md", "new");
        let b = write(&dir, "b.md", "original");
        let c = dir.path().join("c.md");

        let mut index = FileIndex::new();
        index.insert(b.clone(), fingerprint(&b, "file-b", None));
        index.insert(c.clone(), FileRecord::new("file-c", 1, "0123456789abcdef"));

        fs::write(&b, "changed!").unwrap();
        set_mtime(&b, 3600);

        let diff = ChangeDetector::new().diff(&[a.clone(), b.clone()], &mut index);
        assert_eq!(diff.added, vec![a]);
        assert_eq!(diff.modified, vec![b]);
        assert_eq!(diff.removed, vec![c]);
    }

    #[test]
    fn touched_but_identical_file_refreshes_mtime_only() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "doc.md", "stable");
        let mut index = FileIndex::new();
        let mut record = fingerprint(&path, "file-1", None);
        record.last_modified -= 500;
        index.insert(path.clone(), record);

        let diff = ChangeDetector::new().diff(slice::from_ref(&path), &mut index);
        assert!(diff.is_empty());
        assert_eq!(
            index.get(&path).unwrap().last_modified,
            modified_secs(&path).unwrap()
        );
    }

    #[test]
    fn legacy_record_without_hash_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "doc.md", "content");
        let mut index = FileIndex::new();
        index.insert(path.clone(), FileRecord::new("file-1", 0, ""));

        let diff = ChangeDetector::new().diff(slice::from_ref(&path), &mut index);
        assert_eq!(diff.modified, vec![path]);
    }

    #[test]
    fn oversized_file_with_new_mtime_is_modified_without_hashing() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "big.log", "0123456789");
        let mut index = FileIndex::new();
        let mut record = fingerprint(&path, "file-1", Some(4));
        assert!(record.content_hash.is_empty());
        record.last_modified -= 10;
        index.insert(path.clone(), record);

        let detector = ChangeDetector::new().with_max_hash_bytes(Some(4));
        let diff = detector.diff(slice::from_ref(&path), &mut index);
        assert_eq!(diff.modified, vec![path.clone()]);
        assert!(index.get(&path).unwrap().content_hash.is_empty());
    }

    #[test]
    fn unchanged_file_is_not_reported() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "doc.md", "content");
        let mut index = FileIndex::new();
        index.insert(path.clone(), fingerprint(&path, "file-1", None));

        let diff = ChangeDetector::new().diff(&[path.clone(), path.clone()], &mut index);
        assert!(diff.is_empty());
    }
}
