//! Provider capability sets seen from the sync and chat layers

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crag_config::KnowledgeSettings;
use crag_context::{ChatSession, CompactionOutcome, ModelLimitsSource, ModelRegistry};
use crag_providers::{Capability, GeminiClient, ProviderClient, StreamHandlers};
use crag_sync::{KnowledgeStoreSync, SyncError};
use crag_types::{ChatConfig, FileIndex, Provider, ReasoningEffort};
use serde_json::{Value, json};
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::common::{corpus, fast_engine, openai_client, sse};

fn gemini(server: &MockServer) -> ProviderClient {
    ProviderClient::Gemini(
        GeminiClient::new("g-key")
            .with_base_url(format!("{}/v1beta", server.uri()))
            .with_http_client(reqwest::Client::new()),
    )
}

#[test]
fn provider_and_effort_aliases() {
    assert_eq!(Provider::parse("OpenAI").unwrap(), Provider::OpenAI);
    assert_eq!(Provider::parse("gemini").unwrap(), Provider::Gemini);
    assert!(Provider::parse("mistral").is_err());

    assert_eq!(ReasoningEffort::parse("h").unwrap(), ReasoningEffort::High);
    assert_eq!(ReasoningEffort::parse("medium").unwrap(), ReasoningEffort::Medium);
    assert!(ReasoningEffort::parse("x").is_err());
}

#[tokio::test]
async fn capability_sets_differ_by_provider() {
    let server = MockServer::start().await;
    let openai = openai_client(&server);
    let gemini = gemini(&server);

    for capability in [
        Capability::Chat,
        Capability::Models,
        Capability::Files,
        Capability::KnowledgeStore,
        Capability::Compaction,
    ] {
        assert!(openai.supports(capability));
    }
    assert!(gemini.supports(Capability::Chat));
    assert!(gemini.supports(Capability::Models));
    assert!(!gemini.supports(Capability::Files));
    assert!(!gemini.supports(Capability::KnowledgeStore));
    assert!(!gemini.supports(Capability::Compaction));
}

#[tokio::test]
async fn gemini_cannot_host_a_knowledge_store() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let (_dir, files) = corpus(&[("a.md", "# A")]);
    let sync = KnowledgeStoreSync::new(gemini(&server), fast_engine(), KnowledgeSettings::default());
    let err = sync
        .create_from(files, &mut FileIndex::new())
        .await
        .unwrap_err();

    let SyncError::NoUploads { failures } = err else {
        panic!("expected NoUploads, got {err:?}");
    };
    assert_eq!(failures.len(), 1);
    assert!(failures[0].1.contains("does not support"), "{}", failures[0].1);
}

#[tokio::test]
async fn model_listing_seeds_the_registry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "models/gemini-3-pro-preview", "inputTokenLimit": 2_000_000,
                 "supportedGenerationMethods": ["generateContent", "countTokens"]},
                {"name": "models/text-embedding-004", "inputTokenLimit": 2048,
                 "supportedGenerationMethods": ["embedContent"]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let models = gemini(&server).list_models().await.unwrap();
    assert_eq!(models.len(), 1);

    let registry = ModelRegistry::from_listing(&models);
    let resolved = registry.get("gemini-3-pro-preview");
    assert_eq!(resolved.source(), ModelLimitsSource::Override);
    assert_eq!(resolved.limits().context_window(), 2_000_000);
    assert_eq!(
        registry.get("gemini-2.5-flash").source(),
        ModelLimitsSource::Prefix("gemini-2.5")
    );
}

#[tokio::test]
async fn gemini_session_resends_history_and_never_compacts() {
    let server = MockServer::start().await;
    let rounds = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&rounds);
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-3-flash-preview:streamGenerateContent"))
        .respond_with(move |req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            let contents = body["contents"].as_array().unwrap();
            let reply = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(contents.len(), 1);
                "first"
            } else {
                assert_eq!(contents.len(), 3);
                assert_eq!(contents[1]["role"], "model");
                assert_eq!(contents[1]["parts"][0]["text"], "first");
                "second"
            };
            let chunk = json!({
                "candidates": [{"content": {"parts": [{"text": reply}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 990, "candidatesTokenCount": 1}
            });
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[chunk]))
        })
        .expect(2)
        .mount(&server)
        .await;

    let mut session = ChatSession::new(gemini(&server), ChatConfig::new("gemini-3-flash-preview"))
        .with_max_context_tokens(1_000);
    let mut on_text = |_: &str| {};
    let never = || false;

    let turn = session
        .send_turn("one", StreamHandlers::new(&mut on_text, &never))
        .await
        .unwrap();
    assert_eq!(turn.compaction, CompactionOutcome::Unsupported);
    assert_eq!(session.window().continuation(), None);

    let turn = session
        .send_turn("two", StreamHandlers::new(&mut on_text, &never))
        .await
        .unwrap();
    assert_eq!(turn.reply, "second");
    assert_eq!(session.window().len(), 4);
}
