//! One chat conversation: window, continuation token, and post-turn compaction.

use crag_providers::{ProviderClient, ProviderError, StreamHandlers};
use crag_types::{ChatConfig, ConversationWindow, StreamResult, Usage};
use tracing::debug;

use crate::compactor::{CompactionOutcome, ContextCompactor};
use crate::model_limits::ModelRegistry;

/// Result of one [`ChatSession::send_turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub result: StreamResult,
    /// Concatenated text deltas of the final response.
    pub reply: String,
    pub compaction: CompactionOutcome,
}

/// Owns the conversation window and keeps it under the model's context limit.
///
/// A failed or cancelled turn leaves the window exactly as it was before the
/// turn started.
#[derive(Debug, Clone)]
pub struct ChatSession {
    client: ProviderClient,
    config: ChatConfig,
    window: ConversationWindow,
    max_context_tokens: u32,
    compactor: ContextCompactor,
    total_usage: Usage,
}

impl ChatSession {
    #[must_use]
    pub fn new(client: ProviderClient, config: ChatConfig) -> Self {
        Self::with_registry(client, config, &ModelRegistry::new())
    }

    #[must_use]
    pub fn with_registry(client: ProviderClient, config: ChatConfig, registry: &ModelRegistry) -> Self {
        let max_context_tokens = registry.get(&config.model).limits().context_window();
        Self {
            client,
            config,
            window: ConversationWindow::new(),
            max_context_tokens,
            compactor: ContextCompactor::new(),
            total_usage: Usage::default(),
        }
    }

    /// Resume from a stored window.
    #[must_use]
    pub fn with_window(mut self, window: ConversationWindow) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_max_context_tokens(mut self, tokens: u32) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    #[must_use]
    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    #[must_use]
    pub fn max_context_tokens(&self) -> u32 {
        self.max_context_tokens
    }

    /// Usage summed over every completed turn of this session.
    #[must_use]
    pub fn total_usage(&self) -> Usage {
        self.total_usage
    }

    /// Send `message` as the next user turn.
    ///
    /// Text deltas are forwarded to `handlers.on_text` as they arrive and
    /// also collected into [`TurnSummary::reply`].
    pub async fn send_turn(
        &mut self,
        message: &str,
        handlers: StreamHandlers<'_>,
    ) -> Result<TurnSummary, ProviderError> {
        let StreamHandlers {
            on_text,
            on_tool_call,
            cancel,
        } = handlers;

        let snapshot = self.window.clone();
        self.window.push_user(message);

        let mut reply = String::new();
        let mut collect = |delta: &str| {
            reply.push_str(delta);
            on_text(delta);
        };
        let mut inner = StreamHandlers::new(&mut collect, cancel);
        if let Some(handler) = on_tool_call {
            inner = inner.with_tool_handler(handler);
        }

        let config = self.config.clone().with_previous_response(None);
        let result = match self.client.send(&config, &self.window, inner).await {
            Ok(result) => result,
            Err(e) => {
                self.window = snapshot;
                return Err(e);
            }
        };

        if result.cancelled {
            debug!("Turn cancelled; restoring window");
            self.window = snapshot;
            return Ok(TurnSummary {
                result,
                reply,
                compaction: CompactionOutcome::NotNeeded,
            });
        }

        self.total_usage.accumulate(result.usage);
        self.window.set_continuation(result.response_id.clone());
        if !reply.is_empty() {
            self.window.push_assistant(reply.clone());
        }

        let compaction = self
            .compactor
            .maybe_compact(
                &self.client,
                &mut self.window,
                &self.config.model,
                self.max_context_tokens,
                result.last_input_tokens,
            )
            .await;

        Ok(TurnSummary {
            result,
            reply,
            compaction,
        })
    }
}
