//! Remote model-service clients with unified streaming support.
//!
//! # Architecture
//!
//! The crate is organized around a capability-set dispatch enum:
//!
//! - [`ProviderClient`] - one variant per backend; [`ProviderClient::supports`]
//!   reports which [`Capability`] groups a backend implements, and calls to a
//!   missing capability return [`ProviderError::Unsupported`]
//! - [`openai`] - OpenAI client (Responses API, files, vector stores, compaction)
//! - [`gemini`] - Google Gemini client (GenerateContent API, model listing)
//! - `chat` - provider-neutral turn driver shared by both backends
//!
//! # Streaming
//!
//! Responses arrive as newline-delimited `data: <json>` records. Each backend
//! supplies an [`SseParser`] that maps one record to zero or more normalized
//! [`StreamEvent`]s; `chat::run_turn` owns framing, idle timeouts,
//! cancellation, and the per-turn tool-call accumulator.
//!
//! # Error Handling
//!
//! Every failure is a [`ProviderError`]. Cancellation is not an error: a
//! cancelled call returns a [`StreamResult`] with `cancelled` set.

mod chat;
mod error;
pub mod gemini;
pub mod openai;
pub mod retry;
pub mod sse_types;

use std::env;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::de::DeserializeOwned;

pub use crag_types;
pub(crate) use crag_types::{
    ApiKey, BatchStatus, ChatConfig, ConversationWindow, ModelInfo, Provider, StreamEvent,
    StreamResult, ToolCall,
};
pub use error::{Capability, ProviderError};
pub use gemini::GeminiClient;
pub use openai::OpenAIClient;

/// Canonical OpenAI API base URL.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
/// Canonical Gemini API base URL.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// reqwest only exposes tcp_keepalive (idle time); interval/retries use platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

pub(crate) const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Shared HTTPS client for production traffic.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!("Failed to build hardened HTTP client: {e}. Using defaults.");
            reqwest::Client::new()
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
    use reqwest::redirect::Policy;

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("crag/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(Policy::none())
        .https_only(true)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

// ============================================================================
// SSE framing
// ============================================================================

/// Remove and return the next complete line (without its terminator).
pub(crate) fn drain_next_sse_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

/// Payload of a `data:` line. Other fields (`event:`, `id:`, comments) yield `None`.
pub(crate) fn extract_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Maps one decoded stream record to normalized events.
pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> Vec<StreamEvent>;
    fn provider_name(&self) -> &'static str;
}

pub(crate) fn parse_sse_payload<T>(
    json: &serde_json::Value,
    provider_name: &'static str,
) -> Option<T>
where
    T: DeserializeOwned,
{
    match serde_json::from_value(json.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(%e, provider = provider_name, "Failed to parse SSE event");
            None
        }
    }
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turn a single-attempt response into a typed error when it is not 2xx.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_capped_error_body(response).await;
    Err(ProviderError::from_status(status, &body))
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::Protocol(format!("unexpected response body: {e}")))
}

// ============================================================================
// Caller callbacks
// ============================================================================

/// Caller-side callbacks for one `send`.
///
/// `on_text` receives every text delta as it arrives. `on_tool_call`, when
/// present, resolves a finished tool call to its string result. `cancel` is
/// polled on every buffer read.
pub struct StreamHandlers<'a> {
    pub on_text: &'a mut (dyn FnMut(&str) + Send),
    pub on_tool_call: Option<&'a mut (dyn FnMut(&ToolCall) -> String + Send)>,
    pub cancel: &'a (dyn Fn() -> bool + Send + Sync),
}

impl<'a> StreamHandlers<'a> {
    pub fn new(
        on_text: &'a mut (dyn FnMut(&str) + Send),
        cancel: &'a (dyn Fn() -> bool + Send + Sync),
    ) -> Self {
        Self {
            on_text,
            on_tool_call: None,
            cancel,
        }
    }

    #[must_use]
    pub fn with_tool_handler(
        mut self,
        handler: &'a mut (dyn FnMut(&ToolCall) -> String + Send),
    ) -> Self {
        self.on_tool_call = Some(handler);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        (self.cancel)()
    }
}

// ============================================================================
// Capability-set dispatch
// ============================================================================

/// A configured backend.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    OpenAI(OpenAIClient),
    Gemini(GeminiClient),
}

impl ProviderClient {
    #[must_use]
    pub fn new(api_key: ApiKey) -> Self {
        match api_key {
            ApiKey::OpenAI(key) => Self::OpenAI(OpenAIClient::new(key)),
            ApiKey::Gemini(key) => Self::Gemini(GeminiClient::new(key)),
        }
    }

    /// First provider with a non-empty key in the environment, checking
    /// `OPENAI_API_KEY`, `OPEN_AI_API_KEY`, `GEMINI_API_KEY`, `GOOGLE_API_KEY`.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Provider::all().iter().find_map(|provider| {
            provider.env_vars().iter().find_map(|var| {
                env::var(var)
                    .ok()
                    .filter(|key| !key.trim().is_empty())
                    .map(|key| Self::new(ApiKey::new(*provider, key)))
            })
        })
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        match self {
            Self::OpenAI(_) => Provider::OpenAI,
            Self::Gemini(_) => Provider::Gemini,
        }
    }

    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match self {
            Self::OpenAI(_) => true,
            Self::Gemini(_) => matches!(capability, Capability::Chat | Capability::Models),
        }
    }

    #[must_use]
    pub fn with_retry_config(self, retry: retry::RetryConfig) -> Self {
        match self {
            Self::OpenAI(client) => Self::OpenAI(client.with_retry_config(retry)),
            Self::Gemini(client) => Self::Gemini(client.with_retry_config(retry)),
        }
    }

    #[must_use]
    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        match self {
            Self::OpenAI(client) => Self::OpenAI(client.with_idle_timeout(idle_timeout)),
            Self::Gemini(client) => Self::Gemini(client.with_idle_timeout(idle_timeout)),
        }
    }

    fn openai(&self, capability: Capability) -> Result<&OpenAIClient, ProviderError> {
        match self {
            Self::OpenAI(client) => Ok(client),
            Self::Gemini(_) => Err(ProviderError::unsupported(Provider::Gemini, capability)),
        }
    }

    /// Send one conversation turn, resolving tool calls until the model stops
    /// asking for them.
    pub async fn send(
        &self,
        config: &ChatConfig,
        window: &ConversationWindow,
        handlers: StreamHandlers<'_>,
    ) -> Result<StreamResult, ProviderError> {
        match self {
            Self::OpenAI(client) => client.send(config, window, handlers).await,
            Self::Gemini(client) => client.send(config, window, handlers).await,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        match self {
            Self::OpenAI(client) => client.list_models().await,
            Self::Gemini(client) => client.list_models().await,
        }
    }

    /// Condense the conversation behind `previous_response_id` into opaque items.
    pub async fn compact(
        &self,
        model: &str,
        previous_response_id: &str,
    ) -> Result<Vec<serde_json::Value>, ProviderError> {
        self.openai(Capability::Compaction)?
            .compact(model, previous_response_id)
            .await
    }

    /// Upload a file, optionally under a different declared filename.
    pub async fn upload_file(
        &self,
        path: &Path,
        display_name: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.openai(Capability::Files)?
            .upload_file(path, display_name)
            .await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        self.openai(Capability::Files)?.delete_file(file_id).await
    }

    pub async fn create_store(&self, name: &str) -> Result<String, ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .create_store(name)
            .await
    }

    pub async fn delete_store(&self, store_id: &str) -> Result<(), ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .delete_store(store_id)
            .await
    }

    pub async fn attach_file(&self, store_id: &str, file_id: &str) -> Result<(), ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .attach_file(store_id, file_id)
            .await
    }

    pub async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .detach_file(store_id, file_id)
            .await
    }

    pub async fn create_file_batch(
        &self,
        store_id: &str,
        file_ids: &[String],
    ) -> Result<String, ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .create_file_batch(store_id, file_ids)
            .await
    }

    pub async fn batch_status(
        &self,
        store_id: &str,
        batch_id: &str,
    ) -> Result<BatchStatus, ProviderError> {
        self.openai(Capability::KnowledgeStore)?
            .batch_status(store_id, batch_id)
            .await
    }
}
