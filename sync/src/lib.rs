//! Local corpus ↔ remote knowledge store synchronization.
//!
//! - [`ChangeDetector`] diffs the resolved file list against the persisted
//!   [`FileIndex`](crag_types::FileIndex)
//! - [`TransferEngine`] drives per-file network operations with bounded,
//!   adaptive concurrency
//! - [`KnowledgeStoreSync`] combines the two into create, update, and rebuild
//! - [`IndexWatcher`] re-runs the update on a timer

mod detector;
mod knowledge;
mod resolver;
mod transfer;
mod watcher;

pub use detector::{ChangeDetector, content_hash, fingerprint, modified_secs};
pub use knowledge::{KnowledgeStoreSync, Step, SyncError, SyncPhase, SyncReport, execute_step};
pub use resolver::{is_supported_file, resolve_patterns, resolve_patterns_in};
pub use transfer::{Attempt, TransferEngine, TransferReport, TransferResult, TransferUnit};
pub use watcher::IndexWatcher;
