//! Gemini backend: `streamGenerateContent` chat and model listing.
//!
//! Gemini keeps no server-side conversation state, so every request carries
//! the whole window and tool rounds are appended to `contents` locally.
//! Files, knowledge stores, and compaction are not offered by this backend.

use std::fmt;
use std::time::Duration;

use crag_types::{ReasoningEffort, Role, Usage, WindowInput};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::chat::{TurnOutcome, run_turn};
use crate::retry::{RetryConfig, send_with_retry};
use crate::sse_types::gemini as typed;
use crate::{
    ChatConfig, ConversationWindow, DEFAULT_STREAM_IDLE_TIMEOUT, GEMINI_API_BASE, ModelInfo,
    ProviderError, SseParser, StreamEvent, StreamHandlers, StreamResult, check_status,
    decode_json, http_client, parse_sse_payload,
};

const DEFAULT_CONTEXT_TOKENS: u32 = 1_048_576;

#[derive(Clone)]
pub struct GeminiClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    retry: RetryConfig,
    idle_timeout: Duration,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            http: http_client().clone(),
            retry: RetryConfig::default(),
            idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Send one turn, resolving tool calls locally until the model stops
    /// requesting them.
    pub async fn send(
        &self,
        config: &ChatConfig,
        window: &ConversationWindow,
        mut handlers: StreamHandlers<'_>,
    ) -> Result<StreamResult, ProviderError> {
        if config.knowledge_store_id.is_some() {
            tracing::warn!("Gemini has no knowledge store support; ignoring store id");
        }

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, config.model
        );
        let (system, mut contents) = window_contents(window);
        let mut result = StreamResult::default();
        let mut rounds = 0u32;

        loop {
            let body = build_request_body(config, system.as_deref(), &contents);
            tracing::debug!(model = %config.model, round = rounds, "Sending Gemini turn");

            let response = self
                .http
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await?;
            let response = check_status(response).await?;

            let mut parser = GeminiParser;
            let state =
                match run_turn(response, &mut parser, &mut handlers, self.idle_timeout).await? {
                    TurnOutcome::Completed(state) => state,
                    TurnOutcome::Cancelled => return Ok(StreamResult::cancelled()),
                };
            result.usage.accumulate(state.usage);
            result.last_input_tokens = state.usage.input_tokens;

            if state.tool_calls.is_empty() {
                return Ok(result);
            }
            let Some(handler) = handlers.on_tool_call.as_deref_mut() else {
                tracing::warn!(
                    calls = state.tool_calls.len(),
                    "Model requested tool calls but no handler is registered"
                );
                return Ok(result);
            };

            rounds += 1;
            if rounds > config.max_tool_rounds {
                return Err(ProviderError::Protocol(format!(
                    "tool-call loop exceeded {} rounds",
                    config.max_tool_rounds
                )));
            }

            let calls: Vec<Value> = state
                .tool_calls
                .iter()
                .map(|call| json!({"functionCall": {"name": call.name, "args": call.arguments}}))
                .collect();
            let responses: Vec<Value> = state
                .tool_calls
                .iter()
                .map(|call| {
                    let output = handler(call);
                    json!({"functionResponse": {"name": call.name, "response": {"result": output}}})
                })
                .collect();
            contents.push(json!({"role": "model", "parts": calls}));
            contents.push(json!({"role": "user", "parts": responses}));

            if handlers.is_cancelled() {
                return Ok(StreamResult::cancelled());
            }
        }
    }

    /// Models that support `generateContent`, sorted by id.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = send_with_retry(
            || self.http.get(&url).header("x-goog-api-key", &self.api_key),
            None,
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        let list: typed::ModelList = decode_json(response).await?;

        let mut models: Vec<ModelInfo> = list
            .models
            .into_iter()
            .filter(|model| {
                model
                    .supported_generation_methods
                    .iter()
                    .any(|m| m == "generateContent")
            })
            .map(|model| {
                let id = model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string();
                ModelInfo {
                    display_name: model.display_name.unwrap_or_else(|| id.clone()),
                    supports_reasoning: id.starts_with("gemini-2.5") || id.starts_with("gemini-3"),
                    id,
                    max_context_tokens: model.input_token_limit.unwrap_or(DEFAULT_CONTEXT_TOKENS),
                    supports_tools: true,
                }
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

/// Split the window into a system instruction and `contents` entries.
fn window_contents(window: &ConversationWindow) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut contents = Vec::new();
    match window.input() {
        WindowInput::Messages(messages) => {
            for message in messages {
                match message.role {
                    Role::System => system.push(&message.content),
                    Role::User => contents
                        .push(json!({"role": "user", "parts": [text_part(&message.content)]})),
                    Role::Assistant => contents
                        .push(json!({"role": "model", "parts": [text_part(&message.content)]})),
                }
            }
        }
        WindowInput::Compacted(items) => {
            for item in items {
                let role = item.get("role").and_then(Value::as_str);
                let content = item.get("content").and_then(Value::as_str);
                match (role, content) {
                    (Some("user"), Some(text)) => {
                        contents.push(json!({"role": "user", "parts": [text_part(text)]}));
                    }
                    (Some("assistant"), Some(text)) => {
                        contents.push(json!({"role": "model", "parts": [text_part(text)]}));
                    }
                    _ => tracing::debug!("Skipping opaque window item for Gemini"),
                }
            }
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, contents)
}

fn thinking_level(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium | ReasoningEffort::High => "high",
    }
}

fn build_request_body(config: &ChatConfig, system: Option<&str>, contents: &[Value]) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("contents".to_string(), Value::Array(contents.to_vec()));

    if let Some(system) = system {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [text_part(system)] }),
        );
    }

    if !config.tools.is_empty() {
        let declarations: Vec<Value> = config
            .tools
            .iter()
            .map(|tool| {
                let mut parameters = tool.parameters.clone();
                remove_additional_properties(&mut parameters);
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }

    if let Some(effort) = config.reasoning_effort {
        body.insert(
            "generationConfig".to_string(),
            json!({ "thinkingConfig": { "thinkingLevel": thinking_level(effort) } }),
        );
    }

    Value::Object(body)
}

/// Gemini rejects `additionalProperties` in function schemas.
fn remove_additional_properties(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("additionalProperties");
            for value in map.values_mut() {
                remove_additional_properties(value);
            }
        }
        Value::Array(values) => {
            for value in values {
                remove_additional_properties(value);
            }
        }
        _ => {}
    }
}

// ========================================================================
// Gemini SSE Parser
// ========================================================================

/// Each chunk is a full response object; usage metadata in later chunks
/// supersedes earlier values.
struct GeminiParser;

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> Vec<StreamEvent> {
        let Some(response) = parse_sse_payload::<typed::Response>(json, self.provider_name())
        else {
            return Vec::new();
        };

        if let Some(error) = response.error {
            let message = error
                .message
                .unwrap_or_else(|| "Unknown Gemini error".to_string());
            return vec![StreamEvent::Error(message)];
        }

        let mut events = Vec::new();
        let mut finish: Option<StreamEvent> = None;

        for candidate in response.candidates.unwrap_or_default() {
            let parts = candidate
                .content
                .and_then(|content| content.parts)
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.text
                    && !part.thought
                {
                    events.push(StreamEvent::TextDelta(text));
                }

                if let Some(call) = part.function_call {
                    let name = call.name.unwrap_or_default();
                    if name.is_empty() {
                        tracing::warn!("Gemini function call with empty name, skipping");
                        continue;
                    }
                    // Gemini does not issue call ids.
                    let call_id = format!("call_{}", Uuid::new_v4());
                    let arguments = call.args.unwrap_or_else(|| json!({})).to_string();
                    events.push(StreamEvent::ToolCallStarted {
                        call_id: call_id.clone(),
                        name: name.clone(),
                    });
                    events.push(StreamEvent::ToolCallDone {
                        call_id,
                        name,
                        arguments,
                    });
                }
            }

            if let Some(reason) = candidate.finish_reason {
                let reason = typed::FinishReason::parse(&reason);
                finish = Some(match reason.error_message() {
                    Some(message) => StreamEvent::Error(message.to_string()),
                    None => StreamEvent::Completed,
                });
            }
        }

        if let Some(usage) = response.usage_metadata {
            events.push(StreamEvent::Usage(Usage::new(
                usage.prompt_token_count,
                usage.candidates_token_count,
                usage.thoughts_token_count,
            )));
        }
        events.extend(finish);
        events
    }

    fn provider_name(&self) -> &'static str {
        "Gemini"
    }
}
