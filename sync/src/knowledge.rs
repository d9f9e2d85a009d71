//! Keep a remote knowledge store in step with the local corpus.
//!
//! Every per-file network operation runs through the [`TransferEngine`]; a
//! modified file is one unit that walks detach → delete → upload → attach.
//! The [`FileIndex`] is only touched by the calling task, after each phase
//! resolves.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crag_config::KnowledgeSettings;
use crag_providers::{ProviderClient, ProviderError};
use crag_types::{BatchStatus, FileDiff, FileIndex};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::detector::{ChangeDetector, fingerprint};
use crate::resolver::resolve_patterns;
use crate::transfer::{Attempt, TransferEngine, TransferReport};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no supported files found")]
    NoFiles,
    #[error("no files were uploaded successfully ({} failed)", failures.len())]
    NoUploads { failures: Vec<(PathBuf, String)> },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("knowledge store indexing ended with status {0:?}")]
    BatchFailed(BatchStatus),
    #[error("knowledge store indexing did not finish within {0:?}")]
    BatchTimeout(Duration),
    #[error("invalid pattern {pattern}: {message}")]
    Resolve { pattern: String, message: String },
}

/// Which batch a progress callback refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uploading,
    Removing,
    Updating,
    Adding,
    Deleting,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uploading => "Uploading",
            Self::Removing => "Removing",
            Self::Updating => "Updating",
            Self::Adding => "Adding",
            Self::Deleting => "Deleting",
        })
    }
}

pub type ProgressFn = dyn Fn(SyncPhase, usize, usize) + Send + Sync;

/// Outcome of one sync operation. Per-file failures never abort the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub store_id: String,
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
    /// The index differs from before the run, mtime-only refreshes included.
    /// Callers persist the index when this is set.
    pub index_changed: bool,
}

impl SyncReport {
    fn for_store(store_id: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn changed(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// One step of a per-file transfer. `upload` carries a replacement file
/// through the delete phases of a modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Detach {
        file_id: String,
        upload: Option<PathBuf>,
    },
    Delete {
        file_id: String,
        upload: Option<PathBuf>,
    },
    Upload {
        path: PathBuf,
    },
    Attach {
        file_id: String,
    },
}

impl Step {
    fn after_delete(upload: Option<PathBuf>) -> Attempt<Self, Option<String>> {
        match upload {
            Some(path) => Attempt::Next(Self::Upload { path }),
            None => Attempt::Done(None),
        }
    }
}

/// Filename declared on the alternate upload attempt.
fn txt_display_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    format!("{name}.txt")
}

/// Run one attempt of `step`. With no `store_id`, uploads finish without
/// attaching; the caller adds them to a store in one batch.
pub async fn execute_step(
    client: &ProviderClient,
    store_id: Option<&str>,
    step: Step,
    alternate: bool,
) -> Attempt<Step, Option<String>> {
    match step {
        Step::Detach { file_id, upload } => {
            let Some(store_id) = store_id else {
                return Attempt::Next(Step::Delete { file_id, upload });
            };
            match client.detach_file(store_id, &file_id).await {
                Ok(()) => Attempt::Next(Step::Delete { file_id, upload }),
                Err(e) if e.is_not_found() => Attempt::Next(Step::Delete { file_id, upload }),
                Err(e) => e.into(),
            }
        }
        Step::Delete { file_id, upload } => match client.delete_file(&file_id).await {
            Ok(()) => Step::after_delete(upload),
            Err(e) if e.is_not_found() => Step::after_delete(upload),
            Err(e) => e.into(),
        },
        Step::Upload { path } => {
            let display = alternate.then(|| txt_display_name(&path));
            match client.upload_file(&path, display.as_deref()).await {
                Ok(file_id) => match store_id {
                    Some(_) => Attempt::Next(Step::Attach { file_id }),
                    None => Attempt::Done(Some(file_id)),
                },
                Err(e) => e.into(),
            }
        }
        Step::Attach { file_id } => {
            let Some(store_id) = store_id else {
                return Attempt::Done(Some(file_id));
            };
            match client.attach_file(store_id, &file_id).await {
                Ok(()) => Attempt::Done(Some(file_id)),
                Err(e) => e.into(),
            }
        }
    }
}

pub struct KnowledgeStoreSync {
    client: ProviderClient,
    engine: TransferEngine,
    detector: ChangeDetector,
    settings: KnowledgeSettings,
    progress: Option<Arc<ProgressFn>>,
}

impl fmt::Debug for KnowledgeStoreSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeStoreSync")
            .field("provider", &self.client.provider())
            .field("engine", &self.engine)
            .field("detector", &self.detector)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl KnowledgeStoreSync {
    #[must_use]
    pub fn new(client: ProviderClient, engine: TransferEngine, settings: KnowledgeSettings) -> Self {
        let detector = ChangeDetector::new().with_max_hash_bytes(settings.max_hash_bytes);
        Self {
            client,
            engine,
            detector,
            settings,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(
        mut self,
        progress: impl Fn(SyncPhase, usize, usize) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    #[must_use]
    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    #[must_use]
    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    async fn transfer(
        &self,
        phase: SyncPhase,
        store_id: Option<&str>,
        steps: Vec<Step>,
    ) -> TransferReport<Option<String>> {
        if steps.is_empty() {
            return TransferReport {
                results: Vec::new(),
                final_concurrency: self.engine.max_concurrency(),
            };
        }
        let client = &self.client;
        let progress = self.progress.clone();
        self.engine
            .run(
                steps,
                move |step, alternate| execute_step(client, store_id, step, alternate),
                move |done, total| {
                    if let Some(progress) = &progress {
                        progress(phase, done, total);
                    }
                },
            )
            .await
    }

    fn record(&self, index: &mut FileIndex, path: &Path, file_id: &str) {
        index.insert(
            path.to_path_buf(),
            fingerprint(path, file_id, self.detector.max_hash_bytes()),
        );
    }

    /// Upload every file matched by `patterns` into a new store.
    ///
    /// Clears `index` first. Fails without creating a store when nothing
    /// uploads.
    pub async fn create(
        &self,
        patterns: &[String],
        index: &mut FileIndex,
    ) -> Result<SyncReport, SyncError> {
        let files = resolve_patterns(patterns)?;
        self.create_from(files, index).await
    }

    /// [`Self::create`] for an already resolved file list.
    pub async fn create_from(
        &self,
        files: Vec<PathBuf>,
        index: &mut FileIndex,
    ) -> Result<SyncReport, SyncError> {
        if files.is_empty() {
            return Err(SyncError::NoFiles);
        }
        index.clear();
        info!(files = files.len(), "Uploading files");

        let steps = files
            .iter()
            .map(|path| Step::Upload { path: path.clone() })
            .collect();
        let report = self.transfer(SyncPhase::Uploading, None, steps).await;

        let mut sync = SyncReport::default();
        let mut file_ids = Vec::new();
        for result in report.results {
            let path = &files[result.index];
            match result.outcome {
                Ok(Some(file_id)) => {
                    self.record(index, path, &file_id);
                    file_ids.push(file_id);
                    sync.added.push(path.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping file");
                    sync.failures.push((path.clone(), e));
                }
            }
        }

        if file_ids.is_empty() {
            return Err(SyncError::NoUploads {
                failures: sync.failures,
            });
        }

        let store_id = self.client.create_store(&self.settings.store_name).await?;
        info!(%store_id, "Knowledge store created");
        let batch_id = self.client.create_file_batch(&store_id, &file_ids).await?;
        self.wait_for_batch(&store_id, &batch_id).await?;
        info!(%store_id, files = file_ids.len(), "Knowledge store ready");

        sync.store_id = store_id;
        Ok(sync)
    }

    async fn wait_for_batch(&self, store_id: &str, batch_id: &str) -> Result<(), SyncError> {
        let started = Instant::now();
        loop {
            match self.client.batch_status(store_id, batch_id).await? {
                BatchStatus::Completed => return Ok(()),
                status @ (BatchStatus::Failed | BatchStatus::Cancelled) => {
                    return Err(SyncError::BatchFailed(status));
                }
                BatchStatus::InProgress | BatchStatus::Unknown => {}
            }
            if started.elapsed() >= self.settings.batch_timeout {
                return Err(SyncError::BatchTimeout(self.settings.batch_timeout));
            }
            sleep(self.settings.batch_poll_interval).await;
        }
    }

    /// Apply `diff` to the store: removals, then modifications, then additions.
    ///
    /// Index records change only for files whose transfer succeeded.
    pub async fn update(&self, store_id: &str, diff: &FileDiff, index: &mut FileIndex) -> SyncReport {
        let mut report = SyncReport::for_store(store_id);
        if diff.is_empty() {
            return report;
        }
        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            "Changes detected"
        );

        // removals
        let (paths, steps): (Vec<_>, Vec<_>) = diff
            .removed
            .iter()
            .filter_map(|path| {
                let file_id = index.get(path)?.remote_file_id.clone();
                Some((path.clone(), Step::Detach { file_id, upload: None }))
            })
            .unzip();
        let results = self.transfer(SyncPhase::Removing, Some(store_id), steps).await;
        for result in results.results {
            let path = &paths[result.index];
            match result.outcome {
                Ok(_) => {
                    index.remove(path);
                    report.removed.push(path.clone());
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove file");
                    report.failures.push((path.clone(), e));
                }
            }
        }

        // modifications
        let (paths, steps): (Vec<_>, Vec<_>) = diff
            .modified
            .iter()
            .filter_map(|path| {
                let file_id = index.get(path)?.remote_file_id.clone();
                let upload = Some(path.clone());
                Some((path.clone(), Step::Detach { file_id, upload }))
            })
            .unzip();
        let results = self.transfer(SyncPhase::Updating, Some(store_id), steps).await;
        report.modified = self.apply_uploads(results, &paths, index, &mut report.failures);

        // additions
        let steps = diff
            .added
            .iter()
            .map(|path| Step::Upload { path: path.clone() })
            .collect();
        let results = self.transfer(SyncPhase::Adding, Some(store_id), steps).await;
        report.added = self.apply_uploads(results, &diff.added, index, &mut report.failures);

        info!(
            changed = report.changed(),
            failed = report.failures.len(),
            "Knowledge store updated"
        );
        report
    }

    /// Record successful uploads in `index`; returns their paths.
    fn apply_uploads(
        &self,
        results: TransferReport<Option<String>>,
        paths: &[PathBuf],
        index: &mut FileIndex,
        failures: &mut Vec<(PathBuf, String)>,
    ) -> Vec<PathBuf> {
        let mut uploaded = Vec::new();
        for result in results.results {
            let path = &paths[result.index];
            match result.outcome {
                Ok(Some(file_id)) => {
                    self.record(index, path, &file_id);
                    uploaded.push(path.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to upload file");
                    failures.push((path.clone(), e));
                }
            }
        }
        uploaded
    }

    /// Resolve `patterns`, diff against `index`, and apply the diff.
    pub async fn refresh(
        &self,
        store_id: &str,
        patterns: &[String],
        index: &mut FileIndex,
    ) -> Result<SyncReport, SyncError> {
        let files = resolve_patterns(patterns)?;
        Ok(self.refresh_from(store_id, &files, index).await)
    }

    /// [`Self::refresh`] for an already resolved file list.
    pub async fn refresh_from(
        &self,
        store_id: &str,
        files: &[PathBuf],
        index: &mut FileIndex,
    ) -> SyncReport {
        let before = index.clone();
        let diff = self.detector.diff(files, index);
        let mut report = self.update(store_id, &diff, index).await;
        report.index_changed = *index != before;
        report
    }

    /// Delete every known remote file and the store, then create afresh.
    pub async fn rebuild(
        &self,
        old_store_id: &str,
        patterns: &[String],
        index: &mut FileIndex,
    ) -> Result<SyncReport, SyncError> {
        let files = resolve_patterns(patterns)?;
        self.rebuild_from(old_store_id, files, index).await
    }

    /// [`Self::rebuild`] for an already resolved file list.
    pub async fn rebuild_from(
        &self,
        old_store_id: &str,
        files: Vec<PathBuf>,
        index: &mut FileIndex,
    ) -> Result<SyncReport, SyncError> {
        let file_ids: Vec<String> = index
            .iter()
            .map(|(_, record)| record.remote_file_id.clone())
            .collect();
        if !file_ids.is_empty() {
            info!(files = file_ids.len(), "Deleting indexed files");
            let steps = file_ids
                .iter()
                .map(|file_id| Step::Detach {
                    file_id: file_id.clone(),
                    upload: None,
                })
                .collect();
            let report = self
                .transfer(SyncPhase::Deleting, Some(old_store_id), steps)
                .await;
            for (position, error) in report.failures() {
                warn!(file_id = %file_ids[position], %error, "Failed to delete remote file");
            }
            info!(deleted = report.succeeded(), "Deleted files from storage");
        }

        match self.client.delete_store(old_store_id).await {
            Ok(()) => info!(store_id = %old_store_id, "Knowledge store deleted"),
            Err(e) if e.is_not_found() => {
                info!(store_id = %old_store_id, "Knowledge store already deleted");
            }
            Err(e) => warn!(store_id = %old_store_id, error = %e, "Failed to delete knowledge store"),
        }

        index.clear();
        self.create_from(files, index).await
    }
}
