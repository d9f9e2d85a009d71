//! Streaming chat turns through a session: tools, cancellation, compaction

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crag_context::{ChatSession, CompactionOutcome};
use crag_providers::StreamHandlers;
use crag_types::{ChatConfig, ChatMessage, ConversationWindow, ToolCall, ToolDefinition, Usage};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::common::{completed, created, openai_client, stream_response, text, tool_call};

fn session(server: &MockServer, config: ChatConfig) -> ChatSession {
    ChatSession::new(openai_client(server), config)
        .with_window(ConversationWindow::from_messages(vec![ChatMessage::system(
            "Answer from the files.",
        )]))
        .with_max_context_tokens(1_000)
}

#[tokio::test]
async fn knowledge_store_is_attached_as_file_search() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_partial_json(json!({
            "model": "gpt-5.2",
            "stream": true,
            "tools": [{"type": "file_search", "vector_store_ids": ["vs_1"]}]
        })))
        .respond_with(stream_response(&[
            created("resp_1"),
            text("The answer "),
            text("is 42."),
            completed("resp_1", 120, 8),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let config = ChatConfig::new("gpt-5.2").with_knowledge_store(Some("vs_1".into()));
    let mut session = session(&server, config);
    let mut streamed = Vec::new();
    let mut on_text = |t: &str| streamed.push(t.to_string());
    let never = || false;

    let turn = session
        .send_turn("what is the answer?", StreamHandlers::new(&mut on_text, &never))
        .await
        .unwrap();

    assert_eq!(streamed, ["The answer ", "is 42."]);
    assert_eq!(turn.reply, "The answer is 42.");
    assert_eq!(turn.result.usage, Usage::new(120, 8, 0));
    assert_eq!(turn.compaction, CompactionOutcome::NotNeeded);
    assert_eq!(session.window().continuation(), Some("resp_1"));
}

#[tokio::test]
async fn tool_calls_are_resolved_within_one_turn() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(move |req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut records = vec![created("resp_1")];
                records.extend(tool_call("call_1", "word_count", "{\"file\":\"a.md\"}"));
                records.push(completed("resp_1", 50, 5));
                stream_response(&records)
            } else {
                assert_eq!(body["previous_response_id"], "resp_1");
                assert_eq!(body["input"][0]["output"], "17");
                stream_response(&[created("resp_2"), text("a.md has 17 words"), completed("resp_2", 60, 6)])
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let config = ChatConfig::new("gpt-5.2").with_tools(vec![ToolDefinition::new(
        "word_count",
        "Count words in an indexed file",
        json!({"type": "object", "properties": {"file": {"type": "string"}}}),
    )]);
    let mut session = session(&server, config);
    let mut on_text = |_: &str| {};
    let mut requested: Vec<ToolCall> = Vec::new();
    let mut on_tool = |call: &ToolCall| {
        requested.push(call.clone());
        "17".to_string()
    };
    let never = || false;

    let turn = session
        .send_turn(
            "how long is a.md?",
            StreamHandlers::new(&mut on_text, &never).with_tool_handler(&mut on_tool),
        )
        .await
        .unwrap();

    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].arguments["file"], "a.md");
    assert_eq!(turn.reply, "a.md has 17 words");
    assert_eq!(turn.result.usage, Usage::new(110, 11, 0));
    assert_eq!(session.window().continuation(), Some("resp_2"));
}

#[tokio::test]
async fn cancelled_turn_leaves_window_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(stream_response(&[
            created("resp_1"),
            text("partial"),
            text(" never shown"),
            completed("resp_1", 10, 2),
        ]))
        .mount(&server)
        .await;

    let mut session = session(&server, ChatConfig::new("gpt-5.2"));
    let before = session.window().clone();
    let cancelled = AtomicBool::new(false);
    let mut on_text = |_: &str| cancelled.store(true, Ordering::SeqCst);
    let cancel = || cancelled.load(Ordering::SeqCst);

    let turn = session
        .send_turn("hello", StreamHandlers::new(&mut on_text, &cancel))
        .await
        .unwrap();

    assert!(turn.result.cancelled);
    assert_eq!(session.window(), &before);
    assert_eq!(session.total_usage(), Usage::default());
}

#[tokio::test]
async fn over_full_window_is_compacted_and_next_turn_sends_compacted_items() {
    let server = MockServer::start().await;
    let compacted = json!({"type": "compaction", "encrypted_content": "opaque"});

    Mock::given(method("POST"))
        .and(path("/v1/responses/compact"))
        .and(body_partial_json(json!({"previous_response_id": "resp_big"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": [compacted.clone()]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let turns = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&turns);
    let expected = compacted.clone();
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(move |req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                stream_response(&[created("resp_big"), text("long answer"), completed("resp_big", 901, 40)])
            } else {
                assert!(body.get("previous_response_id").is_none());
                assert_eq!(body["input"][0], expected);
                assert_eq!(body["input"][1]["content"], "and then?");
                stream_response(&[created("resp_next"), text("more"), completed("resp_next", 100, 4)])
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let mut session = session(&server, ChatConfig::new("gpt-5.2"));
    let mut on_text = |_: &str| {};
    let never = || false;

    let turn = session
        .send_turn("tell me everything", StreamHandlers::new(&mut on_text, &never))
        .await
        .unwrap();
    assert_eq!(turn.compaction, CompactionOutcome::Compacted { items: 1 });
    assert!(session.window().is_compacted());

    let turn = session
        .send_turn("and then?", StreamHandlers::new(&mut on_text, &never))
        .await
        .unwrap();
    assert_eq!(turn.reply, "more");
    assert_eq!(turn.compaction, CompactionOutcome::NotNeeded);
    assert_eq!(session.window().continuation(), Some("resp_next"));
}
