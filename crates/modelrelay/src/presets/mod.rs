//! Model preset catalog.
//!
//! Presets are declarative YAML records describing how to construct a
//! provider; the registry consults the catalog on lazy lookup. The catalog
//! is an explicit object passed by reference, runtime-extensible, never a
//! global.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::observability::LogEvent;

pub mod compatibility;
pub mod defaults;

pub use compatibility::{CompatibilityChecker, CompatibilityResult};
pub use defaults::ModelDefaultsCatalog;

/// Config handed directly to the local provider constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    /// Path to the GGUF file; computed from `models_dir` + filename when absent.
    pub model_path: Option<String>,
    /// Context window of the model.
    pub context_window: Option<u32>,
    /// Layers offloaded to the GPU; -1 means all.
    pub gpu_layers: Option<i32>,
}

/// Preset of a local GGUF model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelPreset {
    /// Registry name, e.g. `qwen2.5-7b-instruct`.
    pub name: String,
    /// HuggingFace repository the file comes from.
    pub huggingface_repo: String,
    /// GGUF filename; the quantization token is parsed from it.
    pub filename: String,
    /// Model size in billions of parameters.
    pub size_b: f64,
    /// VRAM requirements in MB per quantization, when measured.
    #[serde(default)]
    pub vram_requirements: BTreeMap<String, u64>,
    /// Constructor config.
    #[serde(default)]
    pub provider_config: LocalProviderConfig,
    /// Register this model eagerly at startup.
    #[serde(default)]
    pub autoload: bool,
}

impl LocalModelPreset {
    /// Resolve the on-disk model path.
    pub fn model_path(&self, models_dir: &str) -> PathBuf {
        match &self.provider_config.model_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(models_dir).join(&self.filename),
        }
    }
}

/// Upstream vendor a cloud preset talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudVendor {
    /// api.openai.com
    Openai,
    /// openrouter.ai
    Openrouter,
    /// api.together.xyz
    Together,
    /// Any OpenAI-compatible server (LM Studio, vLLM, Ollama).
    OpenaiCompatible,
}

/// Config handed directly to the cloud provider constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    /// Model id at the vendor, e.g. `gpt-4-turbo`.
    pub model_name: String,
    /// Inline API key; falls back to `api_key_env_var`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Retry count for transient upstream failures.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Preset of a cloud model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudModelPreset {
    /// Registry name.
    pub name: String,
    /// Vendor this preset targets.
    pub provider: CloudVendor,
    /// Env var holding the API key, e.g. `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    /// Constructor config.
    pub provider_config: CloudProviderConfig,
    /// Register this model eagerly at startup.
    #[serde(default)]
    pub autoload: bool,
}

impl CloudModelPreset {
    /// Resolve the API key: inline config wins over the env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.provider_config.api_key.clone().or_else(|| {
            self.api_key_env_var
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .filter(|v| !v.trim().is_empty())
        })
    }
}

/// Preset of an embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelPreset {
    /// Registry name.
    pub name: String,
    /// Upstream model id or repository.
    pub huggingface_repo: String,
    /// Vector dimensionality.
    pub dimensions: u32,
    /// Base URL of the serving endpoint, when not the configured default.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PresetFile<T> {
    #[serde(default = "Vec::new")]
    models: Vec<T>,
}

/// A preset resolved from the catalog, tagged by backend family.
#[derive(Debug, Clone)]
pub enum ResolvedPreset {
    /// Local GGUF preset.
    Local(LocalModelPreset),
    /// Cloud preset.
    Cloud(CloudModelPreset),
    /// Embedding preset.
    Embedding(EmbeddingModelPreset),
}

/// Catalog of model presets, loaded from YAML and runtime-extensible.
pub struct PresetCatalog {
    local: RwLock<HashMap<String, LocalModelPreset>>,
    cloud: RwLock<HashMap<String, CloudModelPreset>>,
    embedding: RwLock<HashMap<String, EmbeddingModelPreset>>,
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            cloud: RwLock::new(HashMap::new()),
            embedding: RwLock::new(HashMap::new()),
        }
    }

    /// Load `local_models.yaml`, `cloud_models.yaml` and
    /// `embedding_models.yaml` from `dir`. Missing files are tolerated;
    /// malformed files are an error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let catalog = Self::new();
        catalog.merge_file::<LocalModelPreset>(&dir.join("local_models.yaml"))?;
        catalog.merge_file::<CloudModelPreset>(&dir.join("cloud_models.yaml"))?;
        catalog.merge_file::<EmbeddingModelPreset>(&dir.join("embedding_models.yaml"))?;
        tracing::info!(
            event = LogEvent::PresetCatalogLoaded.as_str(),
            dir = %dir.display(),
            local = catalog.local_count(),
            cloud = catalog.cloud_count(),
            embedding = catalog.embedding_count(),
            "model preset catalog loaded"
        );
        Ok(catalog)
    }

    fn merge_file<T>(&self, path: &Path) -> Result<()>
    where
        T: for<'de> Deserialize<'de> + PresetEntry,
    {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "preset file missing; skipping");
            return Ok(());
        }
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Validation(format!("cannot read preset file {}: {err}", path.display()))
        })?;
        let file: PresetFile<T> = serde_yaml::from_str(&raw).map_err(|err| {
            Error::Validation(format!("invalid preset file {}: {err}", path.display()))
        })?;
        for preset in file.models {
            preset.insert_into(self);
        }
        Ok(())
    }

    /// Register a local preset at runtime (replaces an existing one).
    pub fn register_local(&self, preset: LocalModelPreset) {
        if let Ok(mut map) = self.local.write() {
            map.insert(preset.name.clone(), preset);
        }
    }

    /// Register a cloud preset at runtime (replaces an existing one).
    pub fn register_cloud(&self, preset: CloudModelPreset) {
        if let Ok(mut map) = self.cloud.write() {
            map.insert(preset.name.clone(), preset);
        }
    }

    /// Register an embedding preset at runtime (replaces an existing one).
    pub fn register_embedding(&self, preset: EmbeddingModelPreset) {
        if let Ok(mut map) = self.embedding.write() {
            map.insert(preset.name.clone(), preset);
        }
    }

    /// Look up a preset by name across all families; local wins over cloud,
    /// cloud over embedding, mirroring the dispatch preference.
    pub fn resolve(&self, name: &str) -> Option<ResolvedPreset> {
        if let Some(preset) = self.local_preset(name) {
            return Some(ResolvedPreset::Local(preset));
        }
        if let Some(preset) = self.cloud_preset(name) {
            return Some(ResolvedPreset::Cloud(preset));
        }
        self.embedding_preset(name).map(ResolvedPreset::Embedding)
    }

    /// Whether any family knows this name.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Local preset by name.
    pub fn local_preset(&self, name: &str) -> Option<LocalModelPreset> {
        self.local.read().ok()?.get(name).cloned()
    }

    /// Cloud preset by name.
    pub fn cloud_preset(&self, name: &str) -> Option<CloudModelPreset> {
        self.cloud.read().ok()?.get(name).cloned()
    }

    /// Embedding preset by name.
    pub fn embedding_preset(&self, name: &str) -> Option<EmbeddingModelPreset> {
        self.embedding.read().ok()?.get(name).cloned()
    }

    /// Presets flagged for eager registration.
    pub fn autoload_presets(&self) -> Vec<ResolvedPreset> {
        let mut out = Vec::new();
        if let Ok(map) = self.local.read() {
            out.extend(
                map.values()
                    .filter(|p| p.autoload)
                    .cloned()
                    .map(ResolvedPreset::Local),
            );
        }
        if let Ok(map) = self.cloud.read() {
            out.extend(
                map.values()
                    .filter(|p| p.autoload)
                    .cloned()
                    .map(ResolvedPreset::Cloud),
            );
        }
        out
    }

    /// All preset names across families, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Ok(map) = self.local.read() {
            names.extend(map.keys().cloned());
        }
        if let Ok(map) = self.cloud.read() {
            names.extend(map.keys().cloned());
        }
        if let Ok(map) = self.embedding.read() {
            names.extend(map.keys().cloned());
        }
        names.sort();
        names.dedup();
        names
    }

    fn local_count(&self) -> usize {
        self.local.read().map(|m| m.len()).unwrap_or(0)
    }

    fn cloud_count(&self) -> usize {
        self.cloud.read().map(|m| m.len()).unwrap_or(0)
    }

    fn embedding_count(&self) -> usize {
        self.embedding.read().map(|m| m.len()).unwrap_or(0)
    }
}

trait PresetEntry {
    fn insert_into(self, catalog: &PresetCatalog);
}

impl PresetEntry for LocalModelPreset {
    fn insert_into(self, catalog: &PresetCatalog) {
        catalog.register_local(self);
    }
}

impl PresetEntry for CloudModelPreset {
    fn insert_into(self, catalog: &PresetCatalog) {
        catalog.register_cloud(self);
    }
}

impl PresetEntry for EmbeddingModelPreset {
    fn insert_into(self, catalog: &PresetCatalog) {
        catalog.register_embedding(self);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_presets_from_yaml_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = std::fs::File::create(dir.path().join("local_models.yaml")).unwrap();
        write!(
            local,
            r#"
models:
  - name: qwen2.5-7b-instruct
    huggingface_repo: Qwen/Qwen2.5-7B-Instruct-GGUF
    filename: qwen2.5-7b-instruct-q4_k_m.gguf
    size_b: 7
    vram_requirements:
      q4_k_m: 5500
      q8_0: 9000
    provider_config:
      context_window: 32768
"#
        )
        .unwrap();
        let mut cloud = std::fs::File::create(dir.path().join("cloud_models.yaml")).unwrap();
        write!(
            cloud,
            r#"
models:
  - name: gpt-4-turbo
    provider: openai
    api_key_env_var: OPENAI_API_KEY
    provider_config:
      model_name: gpt-4-turbo
"#
        )
        .unwrap();

        let catalog = PresetCatalog::load_dir(dir.path()).unwrap();
        assert!(catalog.contains("qwen2.5-7b-instruct"));
        assert!(catalog.contains("gpt-4-turbo"));
        assert!(!catalog.contains("nope"));

        let preset = catalog.local_preset("qwen2.5-7b-instruct").unwrap();
        assert_eq!(preset.vram_requirements["q4_k_m"], 5500);
        assert_eq!(preset.provider_config.context_window, Some(32768));
    }

    #[test]
    fn missing_files_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PresetCatalog::load_dir(dir.path()).unwrap();
        assert!(catalog.names().is_empty());
    }

    #[test]
    fn runtime_registration_is_visible() {
        let catalog = PresetCatalog::new();
        catalog.register_cloud(CloudModelPreset {
            name: "my-model".to_string(),
            provider: CloudVendor::OpenaiCompatible,
            api_key_env_var: None,
            provider_config: CloudProviderConfig {
                model_name: "my-model".to_string(),
                api_key: None,
                base_url: Some("http://localhost:8000/v1".to_string()),
                timeout: None,
                max_retries: None,
            },
            autoload: false,
        });
        assert!(matches!(
            catalog.resolve("my-model"),
            Some(ResolvedPreset::Cloud(_))
        ));
    }

    #[test]
    fn model_path_prefers_explicit_config() {
        let preset = LocalModelPreset {
            name: "m".to_string(),
            huggingface_repo: "r".to_string(),
            filename: "m-q4_k_m.gguf".to_string(),
            size_b: 7.0,
            vram_requirements: BTreeMap::new(),
            provider_config: LocalProviderConfig {
                model_path: Some("/custom/m.gguf".to_string()),
                ..LocalProviderConfig::default()
            },
            autoload: false,
        };
        assert_eq!(
            preset.model_path("/app/models"),
            PathBuf::from("/custom/m.gguf")
        );
        let implicit = LocalModelPreset {
            provider_config: LocalProviderConfig::default(),
            ..preset
        };
        assert_eq!(
            implicit.model_path("/app/models"),
            PathBuf::from("/app/models/m-q4_k_m.gguf")
        );
    }
}
