//! Index → change → refresh → rebuild against a mock knowledge store

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use crag_config::Settings;
use crag_sync::{ChangeDetector, SyncError, modified_secs, resolve_patterns_in};
use crag_types::FileIndex;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{
    STORE_ID, corpus, knowledge_sync, mount_attach, mount_delete_file, mount_detach,
    mount_store_creation, mount_upload, touch_later,
};

/// A server that fails the test if it receives any request.
async fn silent_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    server
}

async fn indexed_corpus() -> (TempDir, Vec<PathBuf>, FileIndex) {
    let (dir, _) = corpus(&[("a.md", "# A"), ("b.md", "# B"), ("c.md", "# C")]);
    fs::write(dir.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
    let files = resolve_patterns_in(dir.path(), &["*".to_string()]).unwrap();
    assert_eq!(files.len(), 3, "binary file must be skipped: {files:?}");

    let server = MockServer::start().await;
    mount_upload(&server, "a.md", "file-a", 1).await;
    mount_upload(&server, "b.md", "file-b", 1).await;
    mount_upload(&server, "c.md", "file-c", 1).await;
    mount_store_creation(&server).await;

    let mut index = FileIndex::new();
    let report = knowledge_sync(&server)
        .create_from(files.clone(), &mut index)
        .await
        .unwrap();
    assert_eq!(report.store_id, STORE_ID);
    assert_eq!(report.added, files);
    assert_eq!(index.len(), 3);

    (dir, files, index)
}

#[tokio::test]
async fn refresh_after_create_sends_nothing() {
    let (dir, files, mut index) = indexed_corpus().await;

    // Persist and reload the way the CLI does between runs.
    let settings_path = dir.path().join("settings.json");
    let settings = Settings {
        knowledge_store_id: Some(STORE_ID.to_string()),
        file_patterns: vec!["*".to_string()],
        indexed_files: index.clone(),
        ..Settings::default()
    };
    settings.save(&settings_path).unwrap();
    let reloaded = Settings::load(&settings_path).unwrap().unwrap();
    assert_eq!(reloaded.indexed_files, index);

    let server = silent_server().await;
    let report = knowledge_sync(&server)
        .refresh_from(STORE_ID, &files, &mut index)
        .await;

    assert_eq!(report.changed(), 0);
    assert!(report.failures.is_empty());
    assert!(!report.index_changed);
    assert_eq!(index, reloaded.indexed_files);
}

#[tokio::test]
async fn touched_but_identical_file_is_not_uploaded() {
    let (_dir, files, mut index) = indexed_corpus().await;
    let before = index.get(&files[0]).unwrap().last_modified;
    touch_later(&files[0]);

    let server = silent_server().await;
    let report = knowledge_sync(&server)
        .refresh_from(STORE_ID, &files, &mut index)
        .await;

    assert_eq!(report.changed(), 0);
    let record = index.get(&files[0]).unwrap();
    assert_eq!(record.remote_file_id, "file-a");
    assert!(record.last_modified > before);
}

#[tokio::test]
async fn refreshed_mtime_is_persisted_and_skips_the_next_hash() {
    let (dir, files, index) = indexed_corpus().await;
    let settings_path = dir.path().join("settings.json");
    let mut settings = Settings {
        knowledge_store_id: Some(STORE_ID.to_string()),
        file_patterns: vec!["*".to_string()],
        indexed_files: index,
        ..Settings::default()
    };
    settings.save(&settings_path).unwrap();
    touch_later(&files[0]);

    // Same save rule as `crag update`.
    let server = silent_server().await;
    let report = knowledge_sync(&server)
        .refresh_from(STORE_ID, &files, &mut settings.indexed_files)
        .await;
    assert_eq!(report.changed(), 0);
    assert!(report.index_changed);
    if report.index_changed {
        settings.save(&settings_path).unwrap();
    }

    let mut reloaded = Settings::load(&settings_path).unwrap().unwrap();
    let touched = modified_secs(&files[0]).unwrap();
    assert_eq!(reloaded.indexed_files.get(&files[0]).unwrap().last_modified, touched);

    // With the mtime on disk matching, the file is no longer re-examined.
    fs::write(&files[0], "# A, edited").unwrap();
    fs::File::options()
        .write(true)
        .open(&files[0])
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(touched as u64))
        .unwrap();
    let diff = ChangeDetector::new().diff(&files, &mut reloaded.indexed_files);
    assert!(diff.is_empty(), "{diff:?}");
}

#[tokio::test]
async fn modify_remove_and_add_are_applied_in_one_refresh() {
    let (dir, files, mut index) = indexed_corpus().await;
    let (a, b, c) = (&files[0], &files[1], &files[2]);

    fs::write(b, "# B, revised").unwrap();
    touch_later(b);
    fs::remove_file(c).unwrap();
    fs::write(dir.path().join("d.md"), "# D").unwrap();
    let current = resolve_patterns_in(dir.path(), &["*".to_string()]).unwrap();
    let d = current.iter().find(|p| p.ends_with("d.md")).unwrap().clone();

    let server = MockServer::start().await;
    mount_detach(&server, "file-c", 1).await;
    mount_delete_file(&server, "file-c", 1).await;
    mount_detach(&server, "file-b", 1).await;
    mount_delete_file(&server, "file-b", 1).await;
    mount_upload(&server, "b.md", "file-b2", 1).await;
    mount_upload(&server, "d.md", "file-d", 1).await;
    mount_attach(&server, 2).await;

    let report = knowledge_sync(&server)
        .refresh_from(STORE_ID, &current, &mut index)
        .await;

    assert_eq!(report.removed, vec![c.clone()]);
    assert_eq!(report.modified, vec![b.clone()]);
    assert_eq!(report.added, vec![d.clone()]);
    assert!(report.failures.is_empty());

    assert!(!index.contains(c));
    assert_eq!(index.get(a).unwrap().remote_file_id, "file-a");
    assert_eq!(index.get(b).unwrap().remote_file_id, "file-b2");
    assert_eq!(index.get(&d).unwrap().remote_file_id, "file-d");
}

#[tokio::test]
async fn failed_upload_leaves_file_out_of_the_index() {
    let (dir, files, mut index) = indexed_corpus().await;
    fs::write(dir.path().join("d.md"), "# D").unwrap();
    let current = resolve_patterns_in(dir.path(), &["*".to_string()]).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(403).set_body_json(
            json!({"error": {"message": "File uploads are disabled"}}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let report = knowledge_sync(&server)
        .refresh_from(STORE_ID, &current, &mut index)
        .await;

    assert!(report.added.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.contains("File uploads are disabled"));
    assert_eq!(index.len(), files.len());
}

#[tokio::test]
async fn rebuild_tolerates_a_missing_store() {
    let (_dir, files, mut index) = indexed_corpus().await;

    let server = MockServer::start().await;
    for id in ["file-a", "file-b", "file-c"] {
        mount_detach(&server, id, 1).await;
        mount_delete_file(&server, id, 1).await;
    }
    Mock::given(method("DELETE"))
        .and(path(format!("/v1/vector_stores/{STORE_ID}")))
        .respond_with(ResponseTemplate::new(404).set_body_json(
            json!({"error": {"message": "No such vector store"}}),
        ))
        .expect(1)
        .mount(&server)
        .await;
    mount_upload(&server, "a.md", "new-a", 1).await;
    mount_upload(&server, "b.md", "new-b", 1).await;
    mount_upload(&server, "c.md", "new-c", 1).await;
    mount_store_creation(&server).await;

    let report = knowledge_sync(&server)
        .rebuild_from(STORE_ID, files.clone(), &mut index)
        .await
        .unwrap();

    assert_eq!(report.added, files);
    assert_eq!(index.get(&files[1]).unwrap().remote_file_id, "new-b");
}

#[tokio::test]
async fn index_with_no_supported_files_fails() {
    let (dir, _) = corpus(&[]);
    fs::write(dir.path().join("blob.bin"), [0u8, 1, 2, 3]).unwrap();
    let files = resolve_patterns_in(dir.path(), &["*".to_string()]).unwrap();

    let server = silent_server().await;
    let err = knowledge_sync(&server)
        .create_from(files, &mut FileIndex::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NoFiles));
}
