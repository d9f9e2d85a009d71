//! Background polling of the indexed corpus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crag_config::Settings;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::resolver::resolve_patterns;
use crate::{KnowledgeStoreSync, SyncError, SyncReport};

/// Periodically re-syncs the store named in the shared settings.
///
/// The settings mutex is held across the whole resolve → diff → update →
/// persist sequence, so foreground commands sharing it never interleave.
#[derive(Debug)]
pub struct IndexWatcher {
    sync: Arc<KnowledgeStoreSync>,
    settings: Arc<Mutex<Settings>>,
    settings_path: PathBuf,
    interval: Duration,
}

impl IndexWatcher {
    #[must_use]
    pub fn new(
        sync: Arc<KnowledgeStoreSync>,
        settings: Arc<Mutex<Settings>>,
        settings_path: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            sync,
            settings,
            settings_path,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// One scan. `Ok(None)` when no store has been created yet.
    pub async fn poll_once(&self) -> Result<Option<SyncReport>, SyncError> {
        let mut settings = self.settings.lock().await;
        let Some(store_id) = settings.knowledge_store_id.clone() else {
            return Ok(None);
        };

        let patterns = settings.file_patterns.clone();
        let files = spawn_blocking(move || resolve_patterns(&patterns))
            .await
            .map_err(|e| SyncError::Resolve {
                pattern: settings.file_patterns.join(" "),
                message: e.to_string(),
            })??;

        let report = self
            .sync
            .refresh_from(&store_id, &files, &mut settings.indexed_files)
            .await;

        if report.index_changed
            && let Err(e) = settings.save(&self.settings_path)
        {
            error!(path = %self.settings_path.display(), error = %e, "Failed to save index");
        }
        Ok(Some(report))
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Watching for changes");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }

                match self.poll_once().await {
                    Ok(Some(report)) if report.changed() > 0 || !report.failures.is_empty() => {
                        info!(
                            added = report.added.len(),
                            modified = report.modified.len(),
                            removed = report.removed.len(),
                            failed = report.failures.len(),
                            "Index refreshed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Index refresh failed"),
                }
            }
            info!("Watcher stopped");
        })
    }
}
