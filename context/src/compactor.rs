//! Server-side compaction of an over-full conversation window.
//!
//! After each completed turn the compactor compares the input token count of
//! the turn's final request against the model's context window. Above 90% it asks the provider
//! to condense the conversation behind the continuation token and swaps the
//! window for the returned items. A failed compaction is logged and the
//! window is left as it was.

use crag_providers::{Capability, ProviderClient};
use crag_types::ConversationWindow;
use tracing::{debug, info, warn};

/// Compaction fires when `input / window` exceeds `NUMERATOR / DENOMINATOR`.
const THRESHOLD_NUMERATOR: u64 = 9;
const THRESHOLD_DENOMINATOR: u64 = 10;

/// What `maybe_compact` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The provider cannot compact conversations.
    Unsupported,
    /// The window is at or below the threshold.
    NotNeeded,
    /// No continuation token to compact from.
    NoContinuation,
    /// The window now holds `items` compacted items.
    Compacted { items: usize },
    /// The request failed; the window is unchanged.
    Failed(String),
}

impl CompactionOutcome {
    #[must_use]
    pub fn is_compacted(&self) -> bool {
        matches!(self, Self::Compacted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextCompactor;

impl ContextCompactor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Strictly above 90% of `max_context_tokens`. Exact integer comparison so
    /// 0.900000 never triggers and 0.900001 always does.
    #[must_use]
    pub fn over_threshold(input_tokens: u32, max_context_tokens: u32) -> bool {
        if max_context_tokens == 0 {
            return false;
        }
        u64::from(input_tokens) * THRESHOLD_DENOMINATOR
            > u64::from(max_context_tokens) * THRESHOLD_NUMERATOR
    }

    /// Compact `window` if it is over-full. `input_tokens` is the prompt size
    /// of the latest request, not a sum over tool rounds. Never fails the
    /// caller's turn.
    pub async fn maybe_compact(
        &self,
        client: &ProviderClient,
        window: &mut ConversationWindow,
        model: &str,
        max_context_tokens: u32,
        input_tokens: u32,
    ) -> CompactionOutcome {
        if !client.supports(Capability::Compaction) {
            return CompactionOutcome::Unsupported;
        }
        if !Self::over_threshold(input_tokens, max_context_tokens) {
            return CompactionOutcome::NotNeeded;
        }
        let Some(previous) = window.continuation().map(str::to_string) else {
            debug!("Window over threshold but no continuation token; skipping compaction");
            return CompactionOutcome::NoContinuation;
        };

        info!(
            input_tokens,
            max_context_tokens, "Compacting conversation window"
        );
        match client.compact(model, &previous).await {
            Ok(items) => {
                let count = items.len();
                window.replace_with_compacted(items);
                info!(items = count, "Conversation window compacted");
                CompactionOutcome::Compacted { items: count }
            }
            Err(e) => {
                warn!(error = %e, "Compaction failed; keeping current window");
                CompactionOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crag_providers::retry::RetryConfig;
    use crag_providers::{GeminiClient, OpenAIClient};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn openai(server: &MockServer) -> ProviderClient {
        ProviderClient::OpenAI(
            OpenAIClient::new("sk-test")
                .with_base_url(format!("{}/v1", server.uri()))
                .with_http_client(reqwest::Client::new())
                .with_retry_config(RetryConfig {
                    max_retries: 0,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    jitter_factor: 0.0,
                }),
        )
    }

    fn window_with_continuation() -> ConversationWindow {
        let mut window = ConversationWindow::new();
        window.push_user("hello");
        window.set_continuation(Some("resp_1".into()));
        window
    }

    #[test]
    fn threshold_boundary_is_strict() {
        let max = 1_000_000;
        assert!(!ContextCompactor::over_threshold(900_000, max));
        assert!(ContextCompactor::over_threshold(900_001, max));
        assert!(!ContextCompactor::over_threshold(10, 0));
    }

    #[tokio::test]
    async fn compacts_over_full_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses/compact"))
            .and(body_json(json!({"model": "gpt-5.2", "previous_response_id": "resp_1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": [{"type": "compaction", "encrypted_content": "abc"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut window = window_with_continuation();
        let outcome = ContextCompactor::new()
            .maybe_compact(
                &openai(&server),
                &mut window,
                "gpt-5.2",
                100_000,
                95_000,
            )
            .await;

        assert_eq!(outcome, CompactionOutcome::Compacted { items: 1 });
        assert!(window.is_compacted());
        assert!(window.continuation().is_none());
    }

    #[tokio::test]
    async fn at_threshold_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut window = window_with_continuation();
        let outcome = ContextCompactor::new()
            .maybe_compact(
                &openai(&server),
                &mut window,
                "gpt-5.2",
                100_000,
                90_000,
            )
            .await;
        assert_eq!(outcome, CompactionOutcome::NotNeeded);
        assert_eq!(window.continuation(), Some("resp_1"));
    }

    #[tokio::test]
    async fn missing_continuation_skips() {
        let server = MockServer::start().await;
        let mut window = ConversationWindow::new();
        let outcome = ContextCompactor::new()
            .maybe_compact(
                &openai(&server),
                &mut window,
                "gpt-5.2",
                100,
                99,
            )
            .await;
        assert_eq!(outcome, CompactionOutcome::NoContinuation);
    }

    #[tokio::test]
    async fn unsupported_provider_is_a_no_op() {
        let client = ProviderClient::Gemini(GeminiClient::new("key"));
        let mut window = window_with_continuation();
        let outcome = ContextCompactor::new()
            .maybe_compact(&client, &mut window, "gemini-3-pro", 100, 99)
            .await;
        assert_eq!(outcome, CompactionOutcome::Unsupported);
        assert!(!window.is_compacted());
    }

    #[tokio::test]
    async fn failure_keeps_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses/compact"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                json!({"error": {"message": "compaction unavailable"}}),
            ))
            .mount(&server)
            .await;

        let mut window = window_with_continuation();
        let before = window.clone();
        let outcome = ContextCompactor::new()
            .maybe_compact(
                &openai(&server),
                &mut window,
                "gpt-5.2",
                100,
                99,
            )
            .await;
        assert!(matches!(outcome, CompactionOutcome::Failed(ref m) if m.contains("compaction unavailable")));
        assert_eq!(window, before);
    }
}
