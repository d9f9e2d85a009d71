//! Shared test utilities and fixtures
//!
//! Mock OpenAI backends, fast transfer engines, and corpus helpers.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crag_config::KnowledgeSettings;
use crag_providers::retry::RetryConfig;
use crag_providers::{OpenAIClient, ProviderClient};
use crag_sync::{KnowledgeStoreSync, TransferEngine};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const STORE_ID: &str = "vs_test";
pub const BATCH_ID: &str = "vsfb_test";

fn no_delay() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_factor: 0.0,
    }
}

/// OpenAI client pointed at `server`, retrying control-plane calls once.
pub fn openai_client(server: &MockServer) -> ProviderClient {
    ProviderClient::OpenAI(
        OpenAIClient::new("sk-test")
            .with_base_url(format!("{}/v1", server.uri()))
            .with_http_client(reqwest::Client::new())
            .with_retry_config(RetryConfig {
                max_retries: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter_factor: 0.0,
            }),
    )
}

pub fn fast_engine() -> TransferEngine {
    TransferEngine::new(4, 2)
        .with_backoff(no_delay())
        .with_poll_interval(Duration::from_millis(5))
}

pub fn knowledge_sync(server: &MockServer) -> KnowledgeStoreSync {
    let settings = KnowledgeSettings {
        batch_poll_interval: Duration::from_millis(5),
        batch_timeout: Duration::from_secs(2),
        ..KnowledgeSettings::default()
    };
    KnowledgeStoreSync::new(openai_client(server), fast_engine(), settings)
}

/// A temp directory holding `files` as (name, body) pairs.
pub fn corpus(files: &[(&str, &str)]) -> (TempDir, Vec<PathBuf>) {
    let dir = TempDir::new().unwrap();
    let paths = files
        .iter()
        .map(|(name, body)| {
            let path = dir.path().join(name);
            fs::write(&path, body).unwrap();
            path
        })
        .collect();
    (dir, paths)
}

/// `POST /files` for a multipart upload named `filename`.
pub async fn mount_upload(server: &MockServer, filename: &str, file_id: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .and(body_string_contains(format!("filename=\"{filename}\"")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": file_id })))
        .expect(times)
        .mount(server)
        .await;
}

/// Store creation, one batch, and a completed batch status.
pub async fn mount_store_creation(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/vector_stores"))
        .and(body_string_contains("cli-rag-store"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": STORE_ID })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/vector_stores/{STORE_ID}/file_batches")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": BATCH_ID })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v1/vector_stores/{STORE_ID}/file_batches/{BATCH_ID}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(server)
        .await;
}

pub async fn mount_attach(server: &MockServer, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/vector_stores/{STORE_ID}/files")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "attached" })))
        .expect(times)
        .mount(server)
        .await;
}

pub async fn mount_detach(server: &MockServer, file_id: &str, times: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("/v1/vector_stores/{STORE_ID}/files/{file_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": true })))
        .expect(times)
        .mount(server)
        .await;
}

pub async fn mount_delete_file(server: &MockServer, file_id: &str, times: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("/v1/files/{file_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": true })))
        .expect(times)
        .mount(server)
        .await;
}

// ============================================================================
// Streaming
// ============================================================================

pub fn sse(records: &[Value]) -> String {
    records
        .iter()
        .map(|record| format!("data: {record}\n\n"))
        .collect()
}

pub fn stream_response(records: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse(records))
}

pub fn created(id: &str) -> Value {
    json!({"type": "response.created", "response": {"id": id}})
}

pub fn text(delta: &str) -> Value {
    json!({"type": "response.output_text.delta", "delta": delta})
}

pub fn completed(id: &str, input_tokens: u32, output_tokens: u32) -> Value {
    json!({
        "type": "response.completed",
        "response": {
            "id": id,
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
        }
    })
}

pub fn tool_call(call_id: &str, name: &str, arguments: &str) -> Vec<Value> {
    vec![
        json!({
            "type": "response.output_item.added",
            "item": {"type": "function_call", "id": "fc_1", "call_id": call_id, "name": name}
        }),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": arguments}),
        json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "arguments": arguments}),
    ]
}

/// Push `path`'s mtime a minute into the future so the next scan re-checks it.
pub fn touch_later(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}
