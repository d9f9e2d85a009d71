//! Provider enumeration, credentials, and model metadata.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAI,
    Gemini,
}

const PROVIDER_PARSE_VALUES: &[&str] = &["openai", "gpt", "chatgpt", "gemini", "google"];

const REASONING_EFFORT_PARSE_VALUES: &[&str] = &["low", "medium", "high", "l", "m", "h"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumKind {
    Provider,
    ReasoningEffort,
}

impl EnumKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EnumKind::Provider => "provider",
            EnumKind::ReasoningEffort => "reasoning effort",
        }
    }
}

impl fmt::Display for EnumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value '{raw}'; expected one of: {expected:?}")]
pub struct EnumParseError {
    kind: EnumKind,
    raw: String,
    expected: &'static [&'static str],
}

impl EnumParseError {
    #[must_use]
    pub fn new(kind: EnumKind, raw: impl Into<String>, expected: &'static [&'static str]) -> Self {
        Self {
            kind,
            raw: raw.into(),
            expected,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EnumKind {
        self.kind
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Gemini => "gemini",
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Gemini => "Gemini",
        }
    }

    /// Environment variables checked for this provider's key, in priority order.
    #[must_use]
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            Provider::OpenAI => &["OPENAI_API_KEY", "OPEN_AI_API_KEY"],
            Provider::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }

    #[must_use]
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAI => "gpt-5.2",
            Provider::Gemini => "gemini-3-flash-preview",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EnumParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" | "chatgpt" => Ok(Provider::OpenAI),
            "gemini" | "google" => Ok(Provider::Gemini),
            _ => Err(EnumParseError::new(
                EnumKind::Provider,
                s.trim(),
                PROVIDER_PARSE_VALUES,
            )),
        }
    }

    #[must_use]
    pub fn all() -> &'static [Provider] {
        &[Provider::OpenAI, Provider::Gemini]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// How much internal deliberation the model performs before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Accepts full names and the single-letter shorthands `l`, `m`, `h`.
    pub fn parse(raw: &str) -> Result<Self, EnumParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "l" => Ok(Self::Low),
            "medium" | "m" => Ok(Self::Medium),
            "high" | "h" => Ok(Self::High),
            _ => Err(EnumParseError::new(
                EnumKind::ReasoningEffort,
                raw.trim(),
                REASONING_EFFORT_PARSE_VALUES,
            )),
        }
    }
}

/// API key tagged with the provider it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub enum ApiKey {
    OpenAI(String),
    Gemini(String),
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiKey::OpenAI(_) => write!(f, "ApiKey::OpenAI(<redacted>)"),
            ApiKey::Gemini(_) => write!(f, "ApiKey::Gemini(<redacted>)"),
        }
    }
}

impl ApiKey {
    #[must_use]
    pub fn new(provider: Provider, key: impl Into<String>) -> Self {
        match provider {
            Provider::OpenAI => ApiKey::OpenAI(key.into()),
            Provider::Gemini => ApiKey::Gemini(key.into()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        match self {
            ApiKey::OpenAI(_) => Provider::OpenAI,
            ApiKey::Gemini(_) => Provider::Gemini,
        }
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        match self {
            ApiKey::OpenAI(key) | ApiKey::Gemini(key) => key,
        }
    }
}

/// A model advertised by a provider's listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub max_context_tokens: u32,
    pub supports_tools: bool,
    pub supports_reasoning: bool,
}
