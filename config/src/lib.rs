//! Configuration for crag.
//!
//! Two files are involved:
//!
//! - `~/.crag/config.toml`: user preferences and tuning knobs ([`CragConfig`]).
//! - `settings.json` in the working directory: the persisted index state
//!   ([`Settings`]), rewritten after every sync.

mod settings;

pub use settings::{SETTINGS_FILE, Settings};

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crag_types::{EnumParseError, Provider, ReasoningEffort};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_STORE_NAME: &str = "cli-rag-store";
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_TRANSFER_POLL_MS: u64 = 100;
const DEFAULT_TRANSFER_DEADLINE_SECS: u64 = 30 * 60;
const DEFAULT_BATCH_POLL_MS: u64 = 1000;
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 10 * 60;
const DEFAULT_MAX_HASH_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 5;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    ParseSettings {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error(transparent)]
    InvalidValue(#[from] EnumParseError),
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::ParseSettings { path, .. }
            | ConfigError::Write { path, .. } => Some(path),
            ConfigError::Serialize(_) | ConfigError::InvalidValue(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CragConfig {
    pub app: Option<AppConfig>,
    pub api_keys: Option<ApiKeys>,
    pub transfer: Option<TransferConfig>,
    pub knowledge: Option<KnowledgeConfig>,
    pub chat: Option<ChatConfigSection>,
}

/// General defaults.
///
/// ```toml
/// [app]
/// provider = "openai"
/// model = "gpt-5.2"
/// reasoning_effort = "medium"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Default, Deserialize)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub google: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(opt: Option<&String>) -> &'static str {
            if opt.is_some() { "[REDACTED]" } else { "None" }
        }
        f.debug_struct("ApiKeys")
            .field("openai", &mask(self.openai.as_ref()))
            .field("google", &mask(self.google.as_ref()))
            .finish()
    }
}

/// Parallel transfer tuning.
///
/// ```toml
/// [transfer]
/// max_concurrency = 8
/// max_retries = 5
/// poll_interval_ms = 100
/// deadline_secs = 1800
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct TransferConfig {
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    /// Wall-clock bound on one transfer batch. `0` disables the bound.
    pub deadline_secs: Option<u64>,
}

/// Knowledge store sync settings.
///
/// ```toml
/// [knowledge]
/// store_name = "cli-rag-store"
/// batch_poll_interval_ms = 1000
/// batch_timeout_secs = 600
/// max_hash_bytes = 268435456
/// watch_interval_secs = 5
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct KnowledgeConfig {
    pub store_name: Option<String>,
    pub batch_poll_interval_ms: Option<u64>,
    pub batch_timeout_secs: Option<u64>,
    /// Files above this size are never hashed; an mtime change alone marks
    /// them modified. `0` hashes everything.
    pub max_hash_bytes: Option<u64>,
    pub watch_interval_secs: Option<u64>,
}

/// Chat request settings.
///
/// ```toml
/// [chat]
/// max_tool_rounds = 32
/// stream_idle_timeout_secs = 120
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ChatConfigSection {
    pub max_tool_rounds: Option<u32>,
    pub stream_idle_timeout_secs: Option<u64>,
}

/// Resolved transfer settings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
}

/// Resolved knowledge store settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeSettings {
    pub store_name: String,
    pub batch_poll_interval: Duration,
    pub batch_timeout: Duration,
    pub max_hash_bytes: Option<u64>,
    pub watch_interval: Duration,
}

/// Resolved chat settings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub max_tool_rounds: u32,
    pub stream_idle_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        CragConfig::default().transfer()
    }
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        CragConfig::default().knowledge()
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        CragConfig::default().chat()
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

impl CragConfig {
    /// Load the user config. `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Directory holding the config file and logs (`~/.crag`).
    #[must_use]
    pub fn dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".crag"))
    }

    pub fn provider(&self) -> Result<Option<Provider>, ConfigError> {
        self.app
            .as_ref()
            .and_then(|app| app.provider.as_deref())
            .map(Provider::parse)
            .transpose()
            .map_err(ConfigError::from)
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.app.as_ref().and_then(|app| app.model.as_deref())
    }

    pub fn reasoning_effort(&self) -> Result<Option<ReasoningEffort>, ConfigError> {
        self.app
            .as_ref()
            .and_then(|app| app.reasoning_effort.as_deref())
            .map(ReasoningEffort::parse)
            .transpose()
            .map_err(ConfigError::from)
    }

    /// API key for `provider`: the config file first, then the environment.
    #[must_use]
    pub fn api_key(&self, provider: Provider) -> Option<String> {
        let configured = self.api_keys.as_ref().and_then(|keys| match provider {
            Provider::OpenAI => keys.openai.as_deref(),
            Provider::Gemini => keys.google.as_deref(),
        });
        configured
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| api_key_from_env(provider))
    }

    #[must_use]
    pub fn transfer(&self) -> TransferSettings {
        let section = self.transfer.as_ref();
        let deadline_secs = section
            .and_then(|t| t.deadline_secs)
            .unwrap_or(DEFAULT_TRANSFER_DEADLINE_SECS);
        TransferSettings {
            max_concurrency: section
                .and_then(|t| t.max_concurrency)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY)
                .max(1),
            max_retries: section
                .and_then(|t| t.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            poll_interval: Duration::from_millis(
                section
                    .and_then(|t| t.poll_interval_ms)
                    .unwrap_or(DEFAULT_TRANSFER_POLL_MS)
                    .max(1),
            ),
            deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
        }
    }

    #[must_use]
    pub fn knowledge(&self) -> KnowledgeSettings {
        let section = self.knowledge.as_ref();
        let max_hash_bytes = section
            .and_then(|k| k.max_hash_bytes)
            .unwrap_or(DEFAULT_MAX_HASH_BYTES);
        KnowledgeSettings {
            store_name: section
                .and_then(|k| k.store_name.clone())
                .unwrap_or_else(|| DEFAULT_STORE_NAME.to_string()),
            batch_poll_interval: Duration::from_millis(
                section
                    .and_then(|k| k.batch_poll_interval_ms)
                    .unwrap_or(DEFAULT_BATCH_POLL_MS),
            ),
            batch_timeout: Duration::from_secs(
                section
                    .and_then(|k| k.batch_timeout_secs)
                    .unwrap_or(DEFAULT_BATCH_TIMEOUT_SECS),
            ),
            max_hash_bytes: (max_hash_bytes > 0).then_some(max_hash_bytes),
            watch_interval: Duration::from_secs(
                section
                    .and_then(|k| k.watch_interval_secs)
                    .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS)
                    .max(1),
            ),
        }
    }

    #[must_use]
    pub fn chat(&self) -> ChatSettings {
        let section = self.chat.as_ref();
        ChatSettings {
            max_tool_rounds: section
                .and_then(|c| c.max_tool_rounds)
                .unwrap_or(crag_types::DEFAULT_MAX_TOOL_ROUNDS)
                .max(1),
            stream_idle_timeout: Duration::from_secs(
                section
                    .and_then(|c| c.stream_idle_timeout_secs)
                    .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS)
                    .max(1),
            ),
        }
    }
}

/// First non-empty key among the provider's environment variables.
#[must_use]
pub fn api_key_from_env(provider: Provider) -> Option<String> {
    provider
        .env_vars()
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|key| !key.trim().is_empty())
}

fn config_path() -> Option<PathBuf> {
    CragConfig::dir().map(|dir| dir.join("config.toml"))
}
