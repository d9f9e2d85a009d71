//! Model context limits and registry.
//!
//! [`ModelLimits`] holds the token window of one model; [`ModelRegistry`]
//! looks limits up by model name with prefix matching, letting limits
//! reported by a provider's model listing take precedence.

use std::collections::HashMap;

use crag_types::ModelInfo;

/// Token constraints for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    /// Maximum input context window in tokens.
    context_window: u32,
    /// Maximum output tokens the model can generate.
    max_output: u32,
}

impl ModelLimits {
    #[must_use]
    pub const fn new(context_window: u32, max_output: u32) -> Self {
        Self {
            context_window,
            max_output,
        }
    }

    #[must_use]
    pub const fn context_window(&self) -> u32 {
        self.context_window
    }

    #[must_use]
    pub const fn max_output(&self) -> u32 {
        self.max_output
    }
}

/// Where model limits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLimitsSource {
    /// Exact match from an override (e.g. a provider model listing).
    Override,
    /// Matched a known prefix (the matched prefix).
    Prefix(&'static str),
    /// Fell back to `DEFAULT_LIMITS` because no match was found.
    DefaultFallback,
}

/// Result of looking up model limits.
///
/// This makes the "fallback OR real data" decision explicit at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModelLimits {
    limits: ModelLimits,
    source: ModelLimitsSource,
}

impl ResolvedModelLimits {
    #[must_use]
    pub const fn new(limits: ModelLimits, source: ModelLimitsSource) -> Self {
        Self { limits, source }
    }

    #[must_use]
    pub const fn limits(self) -> ModelLimits {
        self.limits
    }

    #[must_use]
    pub const fn source(self) -> ModelLimitsSource {
        self.source
    }
}

/// Limits assumed for models nobody told us about.
pub const DEFAULT_LIMITS: ModelLimits = ModelLimits::new(128_000, 16_384);

/// Known model prefixes and their limits, most specific first.
const KNOWN_MODELS: &[(&str, ModelLimits)] = &[
    ("gpt-5.2-pro", ModelLimits::new(400_000, 128_000)),
    ("gpt-5.2", ModelLimits::new(400_000, 128_000)),
    ("gpt-5.1", ModelLimits::new(400_000, 128_000)),
    ("gpt-5-mini", ModelLimits::new(400_000, 128_000)),
    ("gpt-5-nano", ModelLimits::new(400_000, 128_000)),
    ("gpt-5", ModelLimits::new(400_000, 128_000)),
    ("gemini-3-pro", ModelLimits::new(1_048_576, 65_536)),
    ("gemini-3-flash", ModelLimits::new(1_048_576, 65_536)),
    ("gemini-2.5", ModelLimits::new(1_048_576, 65_536)),
];

/// Registry of model limits.
///
/// Lookup order: exact override, then known prefix, then [`DEFAULT_LIMITS`].
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    overrides: HashMap<String, ModelLimits>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed overrides from a provider's model listing. Entries without a
    /// context size are ignored.
    #[must_use]
    pub fn from_listing(models: &[ModelInfo]) -> Self {
        let mut registry = Self::new();
        for model in models.iter().filter(|m| m.max_context_tokens > 0) {
            let max_output = registry.get(&model.id).limits().max_output();
            registry.set_override(
                model.id.clone(),
                ModelLimits::new(model.max_context_tokens, max_output),
            );
        }
        registry
    }

    #[must_use]
    pub fn get(&self, model: &str) -> ResolvedModelLimits {
        if let Some(limits) = self.overrides.get(model) {
            return ResolvedModelLimits::new(*limits, ModelLimitsSource::Override);
        }

        for (prefix, limits) in KNOWN_MODELS {
            if model.starts_with(prefix) {
                return ResolvedModelLimits::new(*limits, ModelLimitsSource::Prefix(prefix));
            }
        }

        ResolvedModelLimits::new(DEFAULT_LIMITS, ModelLimitsSource::DefaultFallback)
    }

    pub fn set_override(&mut self, model: String, limits: ModelLimits) {
        self.overrides.insert(model, limits);
    }

    pub fn remove_override(&mut self, model: &str) -> Option<ModelLimits> {
        self.overrides.remove(model)
    }

    #[must_use]
    pub fn has_override(&self, model: &str) -> bool {
        self.overrides.contains_key(model)
    }
}
