//! Per-model generation parameter defaults.
//!
//! Lookup order: exact model name, then longest registered prefix, then the
//! global defaults baked into [`GenerationParams::default`].

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::providers::GenerationParams;

/// Partial parameter overrides attached to one model name or prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    /// Default sampling temperature.
    pub temperature: Option<f64>,
    /// Default output cap.
    pub max_tokens: Option<u32>,
    /// Default nucleus threshold.
    pub top_p: Option<f64>,
    /// Default top-k.
    pub top_k: Option<u32>,
}

impl ModelDefaults {
    fn apply(&self, params: &mut GenerationParams) {
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            params.max_tokens = max_tokens;
        }
        if let Some(top_p) = self.top_p {
            params.top_p = top_p;
        }
        if let Some(top_k) = self.top_k {
            params.top_k = top_k;
        }
    }
}

/// Runtime-extensible catalog of per-model defaults.
pub struct ModelDefaultsCatalog {
    entries: RwLock<HashMap<String, ModelDefaults>>,
}

impl Default for ModelDefaultsCatalog {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ModelDefaultsCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Catalog seeded with well-known model families.
    pub fn with_builtin() -> Self {
        let catalog = Self::new();
        let chatty = ModelDefaults {
            temperature: Some(0.7),
            max_tokens: Some(4096),
            top_p: Some(1.0),
            top_k: None,
        };
        catalog.register("gpt-", chatty.clone());
        catalog.register(
            "claude-",
            ModelDefaults {
                temperature: Some(1.0),
                ..chatty.clone()
            },
        );
        let instruct = ModelDefaults {
            temperature: Some(0.7),
            max_tokens: Some(2048),
            top_p: Some(0.9),
            top_k: Some(40),
        };
        catalog.register("qwen", instruct.clone());
        catalog.register("llama-", instruct.clone());
        catalog.register("mistral-", instruct);
        catalog
    }

    /// Register defaults for a model name or prefix (replaces existing).
    pub fn register(&self, model: &str, defaults: ModelDefaults) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(model.to_string(), defaults);
        }
    }

    /// Defaults for a model, resolved exact-then-prefix.
    pub fn defaults_for(&self, model: &str) -> ModelDefaults {
        let Ok(entries) = self.entries.read() else {
            return ModelDefaults::default();
        };
        if let Some(found) = entries.get(model) {
            return found.clone();
        }
        entries
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, defaults)| defaults.clone())
            .unwrap_or_default()
    }

    /// Build effective parameters for a model from the global baseline.
    pub fn params_for(&self, model: &str) -> GenerationParams {
        let mut params = GenerationParams::default();
        self.defaults_for(model).apply(&mut params);
        params
    }

    /// All registered entries, for introspection.
    pub fn list(&self) -> HashMap<String, ModelDefaults> {
        self.entries.read().map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_prefix() {
        let catalog = ModelDefaultsCatalog::with_builtin();
        catalog.register(
            "gpt-4-turbo",
            ModelDefaults {
                max_tokens: Some(8192),
                ..ModelDefaults::default()
            },
        );
        assert_eq!(catalog.params_for("gpt-4-turbo").max_tokens, 8192);
        // Prefix fallback for an unregistered sibling.
        assert_eq!(catalog.params_for("gpt-4o-mini").max_tokens, 4096);
    }

    #[test]
    fn unknown_model_gets_global_defaults() {
        let catalog = ModelDefaultsCatalog::with_builtin();
        let params = catalog.params_for("totally-unknown");
        assert!((params.temperature - 0.1).abs() < f64::EPSILON);
        assert_eq!(params.max_tokens, 2048);
    }
}
