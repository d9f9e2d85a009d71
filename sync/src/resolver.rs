//! Expand file patterns into the set of files to index.
//!
//! A pattern is a glob (`docs/**/*.md`), a literal file, or a literal
//! directory walked recursively. Only supported files are kept: a known
//! document or source extension, or contents that sniff as text.

use std::collections::BTreeSet;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::SyncError;

const SNIFF_BYTES: usize = 8 * 1024;

const SUPPORTED_EXTENSIONS: &[&str] = &[
    // documents
    "txt", "md", "pdf", "doc", "docx", "pptx", "html", "htm",
    // data
    "json", "xml", "csv", "tsv", "yaml", "yml",
    // source
    "py", "js", "ts", "jsx", "tsx", "java", "c", "cpp", "h", "hpp", "cs", "go", "rs", "rb", "php",
    "swift", "kt", "scala", "r", "sh", "bash", "zsh", "ps1", "bat", "cmd", "sql", "lua", "pl",
    "hs", "elm", "ex", "exs", "clj", "lisp", "scm", "ml", "fs",
    // config and markup
    "toml", "ini", "cfg", "conf", "tex", "rst", "org", "adoc",
];

/// Resolve `patterns` relative to the current directory.
pub fn resolve_patterns(patterns: &[String]) -> Result<Vec<PathBuf>, SyncError> {
    let cwd = env::current_dir().map_err(|e| SyncError::Resolve {
        pattern: ".".to_string(),
        message: e.to_string(),
    })?;
    resolve_patterns_in(&cwd, patterns)
}

/// Resolve `patterns` relative to `base`. Results are absolute, unique, and sorted.
pub fn resolve_patterns_in(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = BTreeSet::new();

    for pattern in patterns {
        if is_glob(pattern) {
            let before = files.len();
            expand_glob(base, pattern, &mut files)?;
            if files.len() == before {
                warn!(%pattern, "No matches for pattern");
            }
            continue;
        }

        let path = base.join(pattern);
        if path.is_dir() {
            walk(&path, &mut files, |_| true);
        } else if path.is_file() {
            if is_supported_file(&path) {
                files.insert(path);
            } else {
                warn!(path = %path.display(), "Unsupported file type (binary)");
            }
        } else {
            warn!(%pattern, "File not found");
        }
    }

    Ok(files.into_iter().collect())
}

fn is_glob(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

fn expand_glob(base: &Path, pattern: &str, files: &mut BTreeSet<PathBuf>) -> Result<(), SyncError> {
    let (root, rest) = split_literal_prefix(Path::new(pattern));
    let root = base.join(root);
    let matcher = GlobBuilder::new(&rest)
        .literal_separator(true)
        .build()
        .map_err(|e| SyncError::Resolve {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?
        .compile_matcher();

    if !root.is_dir() {
        return Ok(());
    }
    walk(&root, files, |path| {
        path.strip_prefix(&root)
            .is_ok_and(|relative| matcher.is_match(relative))
    });
    Ok(())
}

/// Split a pattern into the literal directory before the first glob
/// component and the glob remainder, joined with `/`.
fn split_literal_prefix(pattern: &Path) -> (PathBuf, String) {
    let mut root = PathBuf::new();
    let mut rest = Vec::new();
    for component in pattern.components() {
        let text = component.as_os_str().to_string_lossy();
        if !rest.is_empty() || (matches!(component, Component::Normal(_)) && is_glob(&text)) {
            rest.push(text.into_owned());
        } else {
            root.push(component);
        }
    }
    (root, rest.join("/"))
}

fn walk(root: &Path, files: &mut BTreeSet<PathBuf>, keep: impl Fn(&Path) -> bool) {
    for entry in WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if !keep(path) {
            continue;
        }
        if is_supported_file(path) {
            files.insert(path.to_path_buf());
        } else {
            debug!(path = %path.display(), "Skipping binary file");
        }
    }
}

fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Text heuristic over the first 8 KiB: no NUL and no control bytes besides
/// tab, LF and CR. Empty files count as text.
fn is_text_file(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut sample = Vec::with_capacity(SNIFF_BYTES);
    if file.take(SNIFF_BYTES as u64).read_to_end(&mut sample).is_err() {
        return false;
    }
    sample
        .iter()
        .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r'))
}

#[must_use]
pub fn is_supported_file(path: &Path) -> bool {
    is_supported_extension(path) || is_text_file(path)
}
