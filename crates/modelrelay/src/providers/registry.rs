//! Provider registry: owns provider instances, maps model names to ready
//! providers, lazily instantiates from the preset catalog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::{CloudEndpointSettings, Settings};
use crate::error::{Error, Result};
use crate::observability::LogEvent;
use crate::presets::{CloudModelPreset, CloudVendor, PresetCatalog, ResolvedPreset};
use crate::providers::cloud::CloudEndpoint;
use crate::providers::{
    CloudProvider, EmbeddingProvider, LocalProvider, ModelInfo, Provider,
};

/// Construction knobs the registry needs for lazy instantiation.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding GGUF files.
    pub models_dir: String,
    /// Provider HTTP timeout.
    pub http_timeout: Duration,
    /// Provider HTTP retries.
    pub http_max_retries: u32,
    /// Cloud endpoint defaults.
    pub cloud: CloudEndpointSettings,
}

impl RegistryConfig {
    /// Derive from runtime settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            models_dir: settings.models_dir.clone(),
            http_timeout: settings.http_timeout(),
            http_max_retries: settings.http_max_retries,
            cloud: settings.cloud.clone(),
        }
    }
}

/// Registry + preset-catalog-backed factory for providers.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    catalog: Arc<PresetCatalog>,
    config: RegistryConfig,
}

impl ProviderRegistry {
    /// Build an empty registry over a preset catalog.
    pub fn new(catalog: Arc<PresetCatalog>, config: RegistryConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            catalog,
            config,
        }
    }

    /// The catalog consulted on lazy lookup.
    pub fn catalog(&self) -> &Arc<PresetCatalog> {
        &self.catalog
    }

    /// Explicitly register a provider; duplicate names are a conflict.
    pub async fn register(&self, name: &str, provider: Arc<dyn Provider>) -> Result<()> {
        let mut providers = self.providers.write().await;
        if providers.contains_key(name) {
            return Err(Error::Conflict(format!(
                "provider '{name}' is already registered"
            )));
        }
        providers.insert(name.to_string(), provider);
        tracing::info!(
            event = LogEvent::ProviderRegistered.as_str(),
            name,
            "provider registered"
        );
        Ok(())
    }

    /// Remove a provider; runs its cleanup unless `run_cleanup` is false.
    pub async fn unregister(&self, name: &str, run_cleanup: bool) -> Result<()> {
        let removed = {
            let mut providers = self.providers.write().await;
            providers.remove(name)
        };
        let Some(provider) = removed else {
            return Err(Error::NotFound(format!(
                "provider '{name}' is not registered"
            )));
        };
        if run_cleanup {
            provider.cleanup().await;
        }
        tracing::info!(
            event = LogEvent::ProviderUnregistered.as_str(),
            name,
            run_cleanup,
            "provider unregistered"
        );
        Ok(())
    }

    /// An already-registered provider, or `not-found`.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        providers.get(name).cloned().ok_or_else(|| {
            let mut available: Vec<&String> = providers.keys().collect();
            available.sort();
            let listing = if available.is_empty() {
                "none".to_string()
            } else {
                available
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            Error::NotFound(format!(
                "provider '{name}' is not registered; available: {listing}"
            ))
        })
    }

    /// Registered provider, or one lazily constructed from the preset
    /// catalog. Absence in both is `model-not-found`. Racing creators see
    /// a consistent outcome: the first insert wins and the loser's
    /// instance is dropped unused.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<dyn Provider>> {
        if let Some(existing) = self.providers.read().await.get(name).cloned() {
            return Ok(existing);
        }
        let preset = self.catalog.resolve(name).ok_or_else(|| Error::ModelNotFound {
            model: name.to_string(),
        })?;
        let created = self.build_from_preset(&preset)?;
        let mut providers = self.providers.write().await;
        if let Some(existing) = providers.get(name).cloned() {
            return Ok(existing);
        }
        providers.insert(name.to_string(), Arc::clone(&created));
        tracing::info!(
            event = LogEvent::ProviderLazyCreated.as_str(),
            name,
            "provider lazily created from preset"
        );
        Ok(created)
    }

    /// Construct (but do not register) a provider from a preset.
    pub fn build_from_preset(&self, preset: &ResolvedPreset) -> Result<Arc<dyn Provider>> {
        match preset {
            ResolvedPreset::Local(preset) => Ok(Arc::new(LocalProvider::from_preset(
                preset,
                &self.config.models_dir,
                self.config.http_timeout,
                self.config.http_max_retries,
            ))),
            ResolvedPreset::Cloud(preset) => {
                let provider = self.build_cloud(preset)?;
                Ok(Arc::new(provider))
            }
            ResolvedPreset::Embedding(preset) => {
                let base_url = preset
                    .base_url
                    .clone()
                    .unwrap_or_else(|| self.config.cloud.openai_compatible_base_url.clone());
                let provider = EmbeddingProvider::new(
                    preset.name.clone(),
                    preset.huggingface_repo.clone(),
                    base_url,
                    self.config.cloud.openai_compatible_api_key.clone(),
                    preset.dimensions,
                    self.config.http_timeout,
                )?;
                Ok(Arc::new(provider))
            }
        }
    }

    fn build_cloud(&self, preset: &CloudModelPreset) -> Result<CloudProvider> {
        let (default_base, default_key) = match preset.provider {
            CloudVendor::Openai => (
                self.config.cloud.openai_base_url.clone(),
                self.config.cloud.openai_api_key.clone(),
            ),
            CloudVendor::Openrouter => (
                self.config.cloud.openrouter_base_url.clone(),
                self.config.cloud.openrouter_api_key.clone(),
            ),
            CloudVendor::Together => (
                self.config.cloud.together_base_url.clone(),
                self.config.cloud.together_api_key.clone(),
            ),
            CloudVendor::OpenaiCompatible => (
                self.config.cloud.openai_compatible_base_url.clone(),
                self.config.cloud.openai_compatible_api_key.clone(),
            ),
        };
        let endpoint = CloudEndpoint {
            base_url: preset
                .provider_config
                .base_url
                .clone()
                .unwrap_or(default_base),
            api_key: preset.resolve_api_key().or(default_key),
        };
        let timeout = preset
            .provider_config
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.http_timeout);
        let max_retries = preset
            .provider_config
            .max_retries
            .unwrap_or(self.config.http_max_retries);
        CloudProvider::new(
            preset.name.clone(),
            preset.provider_config.model_name.clone(),
            endpoint,
            timeout,
            max_retries,
        )
    }

    /// Whether a submission naming this model can eventually be dispatched.
    pub async fn is_resolvable(&self, name: &str) -> bool {
        self.providers.read().await.contains_key(name) || self.catalog.contains(name)
    }

    /// Names of registered providers, sorted.
    pub async fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata of every registered model.
    pub async fn get_all_models_info(&self) -> BTreeMap<String, ModelInfo> {
        let snapshot: Vec<(String, Arc<dyn Provider>)> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
                .collect()
        };
        let mut out = BTreeMap::new();
        for (name, provider) in snapshot {
            out.insert(name, provider.model_info().await);
        }
        out
    }

    /// Health of every registered provider.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let snapshot: Vec<(String, Arc<dyn Provider>)> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
                .collect()
        };
        let mut out = BTreeMap::new();
        for (name, provider) in snapshot {
            out.insert(name, provider.health_check().await);
        }
        out
    }

    /// Release every provider's resources (shutdown path).
    pub async fn cleanup_all(&self) {
        let snapshot: Vec<(String, Arc<dyn Provider>)> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
                .collect()
        };
        for (name, provider) in snapshot {
            provider.cleanup().await;
            tracing::info!(
                event = LogEvent::ProviderCleanup.as_str(),
                name = %name,
                "provider cleanup done"
            );
        }
    }

    /// Number of registered providers.
    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::presets::{CloudProviderConfig, CloudVendor};
    use crate::providers::EchoProvider;

    fn registry_with_cloud_preset() -> ProviderRegistry {
        let catalog = Arc::new(PresetCatalog::new());
        catalog.register_cloud(CloudModelPreset {
            name: "gpt-4-turbo".to_string(),
            provider: CloudVendor::Openai,
            api_key_env_var: None,
            provider_config: CloudProviderConfig {
                model_name: "gpt-4-turbo".to_string(),
                api_key: Some("sk-test".to_string()),
                base_url: None,
                timeout: None,
                max_retries: None,
            },
            autoload: false,
        });
        ProviderRegistry::new(
            catalog,
            RegistryConfig {
                models_dir: "/models".to_string(),
                http_timeout: Duration::from_secs(5),
                http_max_retries: 0,
                cloud: CloudEndpointSettings::default(),
            },
        )
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let registry = registry_with_cloud_preset();
        registry
            .register("echo", Arc::new(EchoProvider::new()))
            .await
            .unwrap();
        let err = registry
            .register("echo", Arc::new(EchoProvider::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn get_or_create_builds_from_preset_and_caches() {
        let registry = registry_with_cloud_preset();
        assert!(registry.is_empty().await);
        let first = registry.get_or_create("gpt-4-turbo").await.unwrap();
        let second = registry.get_or_create("gpt-4-turbo").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list_providers().await, vec!["gpt-4-turbo"]);
    }

    #[tokio::test]
    async fn unknown_model_is_model_not_found() {
        let registry = registry_with_cloud_preset();
        let err = registry.get_or_create("nope").await.err().unwrap();
        assert!(matches!(err, Error::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn unregister_removes_and_missing_is_not_found() {
        let registry = registry_with_cloud_preset();
        registry
            .register("echo", Arc::new(EchoProvider::new()))
            .await
            .unwrap();
        registry.unregister("echo", true).await.unwrap();
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.unregister("echo", true).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolvability_covers_catalog_and_registry() {
        let registry = registry_with_cloud_preset();
        assert!(registry.is_resolvable("gpt-4-turbo").await);
        assert!(!registry.is_resolvable("mystery").await);
        registry
            .register("echo", Arc::new(EchoProvider::new()))
            .await
            .unwrap();
        assert!(registry.is_resolvable("echo").await);
    }
}
