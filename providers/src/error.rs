//! Provider error taxonomy.
//!
//! Every remote failure is classified once, here, so callers (the transfer
//! engine, knowledge sync, chat sessions) can branch on the variant instead
//! of re-inspecting status codes and message text.

use std::fmt;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::Provider;

/// A named operation group a backend may or may not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chat,
    Models,
    Files,
    KnowledgeStore,
    Compaction,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Chat,
        Capability::Models,
        Capability::Files,
        Capability::KnowledgeStore,
        Capability::Compaction,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Models => "models",
            Capability::Files => "files",
            Capability::KnowledgeStore => "knowledge store",
            Capability::Compaction => "compaction",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection, TLS, or timeout failure before a status was received.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed or unexpected response data.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Explicit error payload from the service.
    #[error("{0}")]
    Remote(String),
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: Provider,
        capability: Capability,
    },
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// The message is `error.message` from a JSON body when present, else the
    /// raw body text.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = error_message_from_body(body);
        let code = status.as_u16();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Self::RateLimited(message);
        }
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::BAD_REQUEST && mentions_missing(&message))
        {
            return Self::NotFound(message);
        }
        if status.is_server_error() {
            return Self::Server {
                status: code,
                message,
            };
        }
        Self::Client {
            status: code,
            message,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Upload rejected because of the declared filename's extension.
    #[must_use]
    pub fn is_invalid_extension(&self) -> bool {
        matches!(self, Self::Client { message, .. } if message.contains("Invalid extension"))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited(_) | Self::Server { .. }
        )
    }

    pub(crate) fn unsupported(provider: Provider, capability: Capability) -> Self {
        Self::Unsupported {
            provider,
            capability,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

fn mentions_missing(message: &str) -> bool {
    message.contains("No such") || message.contains("not found")
}

fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            ProviderError::Server { status: 502, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, "nope"),
            ProviderError::Client { status: 401, .. }
        ));
    }

    #[test]
    fn not_found_from_404_or_descriptive_400() {
        assert!(ProviderError::from_status(StatusCode::NOT_FOUND, "").is_not_found());

        let body = r#"{"error":{"message":"No such File object: file-abc"}}"#;
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, body);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: No such File object: file-abc");

        let body = r#"{"error":{"message":"Vector store file not found"}}"#;
        assert!(ProviderError::from_status(StatusCode::BAD_REQUEST, body).is_not_found());

        let body = r#"{"error":{"message":"Missing required parameter"}}"#;
        assert!(!ProviderError::from_status(StatusCode::BAD_REQUEST, body).is_not_found());
    }

    #[test]
    fn invalid_extension_is_recognised() {
        let body = r#"{"error":{"message":"Invalid extension bin. Supported formats: ..."}}"#;
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, body);
        assert!(err.is_invalid_extension());
        assert!(!err.is_retryable());
    }

    #[test]
    fn plain_text_body_is_kept() {
        let err = ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, " overloaded \n");
        match err {
            ProviderError::Server { message, .. } => assert_eq!(message, "overloaded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsupported_names_provider_and_capability() {
        let err = ProviderError::unsupported(Provider::Gemini, Capability::Compaction);
        assert_eq!(err.to_string(), "Gemini does not support compaction");
    }
}
