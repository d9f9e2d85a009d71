//! Background watcher picking up a new file and persisting the index

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crag_config::Settings;
use crag_sync::IndexWatcher;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout};

use crate::common::{STORE_ID, corpus, knowledge_sync, mount_attach, mount_upload};

#[tokio::test]
async fn watcher_uploads_new_file_and_saves_settings() {
    let server = wiremock::MockServer::start().await;
    mount_upload(&server, "notes.md", "file-notes", 1).await;
    mount_attach(&server, 1).await;

    let (dir, _) = corpus(&[]);
    let settings_path = dir.path().join("settings.json");
    let settings = Arc::new(Mutex::new(Settings {
        knowledge_store_id: Some(STORE_ID.to_string()),
        file_patterns: vec![format!("{}/*.md", dir.path().display())],
        ..Settings::default()
    }));

    let (tx, rx) = watch::channel(false);
    let handle = IndexWatcher::new(
        Arc::new(knowledge_sync(&server)),
        Arc::clone(&settings),
        settings_path.clone(),
        Duration::from_millis(20),
    )
    .spawn(rx);

    fs::write(dir.path().join("notes.md"), "# notes").unwrap();

    let started = Instant::now();
    loop {
        if let Ok(Some(saved)) = Settings::load(&settings_path)
            && saved.indexed_files.len() == 1
        {
            break;
        }
        assert!(started.elapsed() < Duration::from_secs(5), "index never saved");
        sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("watcher did not stop")
        .unwrap();

    let settings = settings.lock().await;
    let (_, record) = settings.indexed_files.iter().next().unwrap();
    assert_eq!(record.remote_file_id, "file-notes");
}
