//! OpenAI backend: Responses API streaming, compaction, model listing, and
//! (in [`knowledge`]) the file and vector-store endpoints.

mod knowledge;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crag_types::{Role, Usage, WindowInput};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::chat::{TurnOutcome, run_turn};
use crate::retry::{RetryConfig, send_with_retry};
use crate::sse_types::openai as typed;
use crate::{
    ChatConfig, ConversationWindow, DEFAULT_STREAM_IDLE_TIMEOUT, ModelInfo, OPENAI_API_BASE,
    ProviderError, SseParser, StreamEvent, StreamHandlers, StreamResult, check_status,
    decode_json, http_client, parse_sse_payload,
};

/// Context window reported by the listing; refined by the model-limits registry.
const DEFAULT_CONTEXT_TOKENS: u32 = 128_000;
const COMPACTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct OpenAIClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    retry: RetryConfig,
    idle_timeout: Duration,
}

impl fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("base_url", &self.base_url)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
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

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
    }

    /// Send one turn and resolve tool calls until the model answers without any.
    ///
    /// With a continuation token only the most recent user message is sent;
    /// otherwise the whole window is. Each tool round resubmits the handler's
    /// results as `function_call_output` items chained to the response that
    /// requested them.
    pub async fn send(
        &self,
        config: &ChatConfig,
        window: &ConversationWindow,
        mut handlers: StreamHandlers<'_>,
    ) -> Result<StreamResult, ProviderError> {
        let mut previous = config
            .previous_response_id
            .clone()
            .or_else(|| window.continuation().map(str::to_string));
        let mut input = window_input(window, previous.is_some());
        let mut result = StreamResult::default();
        let mut rounds = 0u32;

        loop {
            let body = build_request_body(config, input, previous.as_deref());
            tracing::debug!(
                model = %config.model,
                continuation = previous.is_some(),
                round = rounds,
                "Sending OpenAI turn"
            );

            let response = self
                .request(reqwest::Method::POST, "responses")
                .header(ACCEPT, "text/event-stream")
                .json(&body)
                .send()
                .await?;
            let response = check_status(response).await?;

            let mut parser = ResponsesParser::default();
            let state =
                match run_turn(response, &mut parser, &mut handlers, self.idle_timeout).await? {
                    TurnOutcome::Completed(state) => state,
                    TurnOutcome::Cancelled => return Ok(StreamResult::cancelled()),
                };

            result.usage.accumulate(state.usage);
            result.last_input_tokens = state.usage.input_tokens;
            if state.response_id.is_some() {
                result.response_id.clone_from(&state.response_id);
            }

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
            let Some(response_id) = state.response_id else {
                return Err(ProviderError::Protocol(
                    "tool calls requested by a response without an id".to_string(),
                ));
            };

            input = state
                .tool_calls
                .iter()
                .map(|call| {
                    let output = handler(call);
                    json!({
                        "type": "function_call_output",
                        "call_id": call.call_id,
                        "output": output,
                    })
                })
                .collect();
            previous = Some(response_id);

            if handlers.is_cancelled() {
                return Ok(StreamResult::cancelled());
            }
        }
    }

    /// Condense the conversation behind `previous_response_id`.
    pub async fn compact(
        &self,
        model: &str,
        previous_response_id: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let body = json!({
            "model": model,
            "previous_response_id": previous_response_id,
        });
        let response = send_with_retry(
            || {
                self.request(reqwest::Method::POST, "responses/compact")
                    .json(&body)
            },
            Some(COMPACTION_TIMEOUT),
            &self.retry,
        )
        .await
        .into_result()
        .await?;

        let mut json: Value = decode_json(response).await?;
        match json.get_mut("output").map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            None | Some(Value::Null) => Err(ProviderError::Protocol(
                "compaction response has no output".to_string(),
            )),
            Some(other) => Ok(vec![other]),
        }
    }

    /// GPT-5 family models, sorted by id.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let response = send_with_retry(
            || self.request(reqwest::Method::GET, "models"),
            None,
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        let list: ModelList = decode_json(response).await?;

        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .filter(|entry| entry.id.starts_with("gpt-5"))
            .map(|entry| ModelInfo {
                display_name: entry.id.clone(),
                id: entry.id,
                max_context_tokens: DEFAULT_CONTEXT_TOKENS,
                supports_tools: true,
                supports_reasoning: true,
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

/// System messages map to the "developer" role; the service reserves
/// "system" for its own instructions.
fn openai_role(role: Role) -> &'static str {
    match role {
        Role::System => "developer",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn window_input(window: &ConversationWindow, continuing: bool) -> Vec<Value> {
    if continuing {
        return window
            .last_user_message()
            .map(|message| json!({"role": "user", "content": message.content}))
            .into_iter()
            .collect();
    }
    match window.input() {
        WindowInput::Messages(messages) => messages
            .iter()
            .map(|message| {
                json!({
                    "role": openai_role(message.role),
                    "content": message.content,
                })
            })
            .collect(),
        WindowInput::Compacted(items) => items.clone(),
    }
}

fn build_request_body(config: &ChatConfig, input: Vec<Value>, previous: Option<&str>) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(config.model));
    body.insert("input".to_string(), Value::Array(input));
    body.insert("stream".to_string(), json!(true));

    let mut tools: Vec<Value> = Vec::new();
    if let Some(store_id) = &config.knowledge_store_id {
        tools.push(json!({
            "type": "file_search",
            "vector_store_ids": [store_id],
        }));
    }
    tools.extend(config.tools.iter().map(|tool| {
        json!({
            "type": "function",
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        })
    }));
    if !tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(tools));
    }

    if let Some(effort) = config.reasoning_effort {
        body.insert("reasoning".to_string(), json!({ "effort": effort.as_str() }));
    }
    if let Some(previous) = previous {
        body.insert("previous_response_id".to_string(), json!(previous));
    }

    Value::Object(body)
}

// ========================================================================
// Responses API SSE Parser
// ========================================================================

#[derive(Default)]
struct ResponsesParser {
    created_seen: bool,
    /// item id -> (call id, name), for records that only carry the item id
    item_calls: HashMap<String, (String, String)>,
}

impl SseParser for ResponsesParser {
    fn parse(&mut self, json: &Value) -> Vec<StreamEvent> {
        let Some(event) = parse_sse_payload::<typed::Event>(json, self.provider_name()) else {
            return Vec::new();
        };

        match event {
            typed::Event::Created { response } => {
                match response.and_then(|r| r.id).filter(|id| !id.is_empty()) {
                    Some(id) => {
                        self.created_seen = true;
                        vec![StreamEvent::Created { id }]
                    }
                    None => Vec::new(),
                }
            }

            typed::Event::OutputItemAdded {
                item: Some(typed::OutputItem::FunctionCall { id, call_id, name }),
            } => {
                let call_id = call_id.or_else(|| id.clone()).unwrap_or_default();
                let name = name.unwrap_or_default();
                if let Some(item_id) = id {
                    self.item_calls
                        .insert(item_id, (call_id.clone(), name.clone()));
                }
                vec![StreamEvent::ToolCallStarted { call_id, name }]
            }
            typed::Event::OutputItemAdded { .. } => Vec::new(),

            typed::Event::OutputTextDelta { delta } => {
                delta.map(StreamEvent::TextDelta).into_iter().collect()
            }

            typed::Event::FunctionCallArgumentsDelta { delta, .. } => delta
                .map(StreamEvent::ToolCallArgsDelta)
                .into_iter()
                .collect(),

            typed::Event::FunctionCallArgumentsDone {
                item_id,
                call_id,
                name,
                arguments,
            } => {
                let known = item_id.and_then(|id| self.item_calls.remove(&id));
                let (known_call, known_name) = known.unwrap_or_default();
                vec![StreamEvent::ToolCallDone {
                    call_id: call_id.unwrap_or(known_call),
                    name: name.unwrap_or(known_name),
                    arguments: arguments.unwrap_or_default(),
                }]
            }

            typed::Event::Completed { response } => {
                let mut events = Vec::new();
                if let Some(response) = response {
                    if !self.created_seen
                        && let Some(id) = response.id.filter(|id| !id.is_empty())
                    {
                        self.created_seen = true;
                        events.push(StreamEvent::Created { id });
                    }
                    if let Some(usage) = response.usage {
                        let reasoning = usage
                            .output_tokens_details
                            .map_or(0, |d| d.reasoning_tokens);
                        events.push(StreamEvent::Usage(Usage::new(
                            usage.input_tokens,
                            usage.output_tokens,
                            reasoning,
                        )));
                    }
                }
                events.push(StreamEvent::Completed);
                events
            }

            typed::Event::Incomplete { response } => {
                let reason = response
                    .and_then(|r| r.incomplete_details)
                    .and_then(|d| d.reason)
                    .map_or_else(
                        || "Response incomplete".to_string(),
                        |reason| format!("Response incomplete: {reason}"),
                    );
                vec![StreamEvent::Error(reason)]
            }

            typed::Event::Failed { response, error } => {
                let message = error
                    .and_then(|e| e.message)
                    .or_else(|| response.and_then(|r| r.error).and_then(|e| e.message))
                    .unwrap_or_else(|| "Response failed".to_string());
                vec![StreamEvent::Error(message)]
            }

            typed::Event::Error { error, message } => {
                let message = error
                    .and_then(|e| e.message)
                    .or(message)
                    .unwrap_or_else(|| "Unknown error".to_string());
                vec![StreamEvent::Error(message)]
            }

            typed::Event::Unknown => Vec::new(),
        }
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI"
    }
}
