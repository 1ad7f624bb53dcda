//! Local GGUF provider.
//!
//! Each loaded model is a `llama-server` child process bound to an
//! ephemeral loopback port; generation goes through its OpenAI-compatible
//! API with the llama.cpp dialect (top_k, GBNF grammar). Loading and
//! unloading are the residency manager's levers for VRAM eviction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::observability::LogEvent;
use crate::presets::compatibility::CompatibilityChecker;
use crate::presets::LocalModelPreset;
use crate::providers::cloud::{ChatCompletionsClient, CloudEndpoint};
use crate::providers::{
    ChunkStream, GenerationParams, GenerationResult, LocalControl, ModelInfo, Provider,
    ProviderKind, TaskInput, Usage,
};

const STARTUP_DEADLINE: Duration = Duration::from_secs(60);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct RunningServer {
    child: Child,
    client: ChatCompletionsClient,
    port: u16,
}

/// Provider running one GGUF model on this host.
pub struct LocalProvider {
    name: String,
    model_path: PathBuf,
    context_window: u32,
    gpu_layers: i32,
    quantization: &'static str,
    required_vram_mb: u64,
    timeout: Duration,
    max_retries: u32,
    server: Mutex<Option<RunningServer>>,
}

impl LocalProvider {
    /// Build a (not yet loaded) local provider from its preset.
    pub fn from_preset(
        preset: &LocalModelPreset,
        models_dir: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let quantization = CompatibilityChecker::extract_quantization(&preset.filename);
        let required_vram_mb = CompatibilityChecker::required_vram_mb(preset, quantization);
        Self {
            name: preset.name.clone(),
            model_path: preset.model_path(models_dir),
            context_window: preset.provider_config.context_window.unwrap_or(4096),
            gpu_layers: preset.provider_config.gpu_layers.unwrap_or(-1),
            quantization,
            required_vram_mb,
            timeout,
            max_retries,
            server: Mutex::new(None),
        }
    }

    async fn spawn_server(&self) -> Result<RunningServer> {
        if !self.model_path.exists() {
            return Err(Error::NotFound(format!(
                "model file not found: {}",
                self.model_path.display()
            )));
        }
        // Grab an ephemeral port, release it, hand it to the child.
        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|err| {
            Error::ProviderUnavailable(format!("cannot allocate local port: {err}"))
        })?;
        let port = listener
            .local_addr()
            .map_err(|err| Error::ProviderUnavailable(format!("cannot read local port: {err}")))?
            .port();
        drop(listener);

        let child = Command::new("llama-server")
            .arg("--model")
            .arg(&self.model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(self.context_window.to_string())
            .arg("--n-gpu-layers")
            .arg(self.gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::ProviderUnavailable(format!("cannot spawn llama-server: {err}"))
            })?;

        let base_url = format!("http://127.0.0.1:{port}/v1");
        self.wait_until_healthy(port, &child).await?;

        let client = ChatCompletionsClient::new(
            CloudEndpoint {
                base_url,
                api_key: None,
            },
            self.timeout,
            self.max_retries,
            true,
        )?;
        Ok(RunningServer {
            child,
            client,
            port,
        })
    }

    async fn wait_until_healthy(&self, port: u16, child: &Child) -> Result<()> {
        let probe = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|err| Error::ProviderUnavailable(format!("cannot build probe: {err}")))?;
        let url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + STARTUP_DEADLINE;
        loop {
            if child.id().is_none() {
                return Err(Error::ProviderUnavailable(format!(
                    "llama-server for '{}' exited during startup",
                    self.name
                )));
            }
            if let Ok(response) = probe.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "llama-server for '{}' did not become healthy within {}s",
                    self.name,
                    STARTUP_DEADLINE.as_secs()
                )));
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    async fn loaded_client(&self) -> Result<ChatCompletionsClient> {
        let server = self.server.lock().await;
        server
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| {
                Error::ProviderUnavailable(format!("local model '{}' is not loaded", self.name))
            })
    }

    /// Estimated usage when the upstream reports none.
    fn fallback_usage(input: &TaskInput, text: &str) -> Usage {
        let prompt_tokens = input
            .as_messages()
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum::<u64>()
            .max(1);
        let completion_tokens = (text.split_whitespace().count() as u64).max(1);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn generate(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<GenerationResult> {
        params.validate()?;
        let client = self.loaded_client().await?;
        let response = client.chat(&self.name, input, params).await?;
        let usage = response.usage.map(Usage::from);
        let choice = response.choices.into_iter().next().ok_or_else(|| {
            Error::GenerationFailed("llama-server response has no choices".to_string())
        })?;
        let text = choice.message.content.unwrap_or_default();
        let usage = usage.unwrap_or_else(|| Self::fallback_usage(input, &text));
        let mut extra = BTreeMap::new();
        extra.insert(
            "quantization".to_string(),
            Value::String(self.quantization.to_string()),
        );
        Ok(GenerationResult {
            text,
            finish_reason: match choice.finish_reason.as_deref() {
                Some("length") => crate::providers::FinishReason::Length,
                Some("error") => crate::providers::FinishReason::Error,
                _ => crate::providers::FinishReason::Stop,
            },
            usage,
            model: self.name.clone(),
            extra,
        })
    }

    async fn generate_stream(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        params.validate()?;
        let client = self.loaded_client().await?;
        client.chat_stream(&self.name, input, params).await
    }

    async fn model_info(&self) -> ModelInfo {
        let server = self.server.lock().await;
        let mut extra = BTreeMap::new();
        extra.insert(
            "model_path".to_string(),
            Value::String(self.model_path.display().to_string()),
        );
        extra.insert(
            "quantization".to_string(),
            Value::String(self.quantization.to_string()),
        );
        extra.insert(
            "required_vram_mb".to_string(),
            Value::from(self.required_vram_mb),
        );
        extra.insert("gpu_layers".to_string(), Value::from(self.gpu_layers));
        if let Some(running) = server.as_ref() {
            extra.insert("port".to_string(), Value::from(running.port));
        }
        ModelInfo {
            name: self.name.clone(),
            provider: ProviderKind::Local,
            context_window: self.context_window,
            max_output_tokens: self.context_window,
            supports_streaming: true,
            supports_structured_output: true,
            loaded: server.is_some(),
            extra,
        }
    }

    async fn health_check(&self) -> bool {
        let client = {
            let server = self.server.lock().await;
            server.as_ref().map(|running| running.client.clone())
        };
        match client {
            Some(client) => client.probe_models_endpoint().await,
            // Unloaded is a valid resting state as long as the file exists.
            None => self.model_path.exists(),
        }
    }

    async fn cleanup(&self) {
        if let Err(err) = LocalControl::unload(self).await {
            tracing::warn!(model = %self.name, error = %err, "local provider cleanup failed");
        }
    }

    fn local_control(&self) -> Option<&dyn LocalControl> {
        Some(self)
    }
}

#[async_trait]
impl LocalControl for LocalProvider {
    async fn load(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }
        let running = self.spawn_server().await?;
        tracing::info!(
            event = LogEvent::ModelLoaded.as_str(),
            model = %self.name,
            port = running.port,
            required_vram_mb = self.required_vram_mb,
            "local model loaded"
        );
        *server = Some(running);
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if let Some(mut running) = server.take() {
            if let Err(err) = running.child.kill().await {
                tracing::warn!(model = %self.name, error = %err, "llama-server kill failed");
            }
            tracing::info!(
                event = LogEvent::ModelUnloaded.as_str(),
                model = %self.name,
                "local model unloaded"
            );
        }
        Ok(())
    }

    async fn is_loaded(&self) -> bool {
        self.server.lock().await.is_some()
    }

    fn required_vram_mb(&self) -> u64 {
        self.required_vram_mb
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::presets::LocalProviderConfig;

    fn preset() -> LocalModelPreset {
        LocalModelPreset {
            name: "test-7b".to_string(),
            huggingface_repo: "org/test".to_string(),
            filename: "test-7b-q8_0.gguf".to_string(),
            size_b: 7.0,
            vram_requirements: [("q8_0".to_string(), 9000)].into_iter().collect(),
            provider_config: LocalProviderConfig {
                model_path: None,
                context_window: Some(8192),
                gpu_layers: None,
            },
            autoload: false,
        }
    }

    #[tokio::test]
    async fn preset_fields_flow_into_provider() {
        let provider =
            LocalProvider::from_preset(&preset(), "/models", Duration::from_secs(30), 0);
        assert_eq!(provider.quantization, "q8_0");
        assert_eq!(provider.required_vram_mb, 9000);
        assert!(!LocalControl::is_loaded(&provider).await);

        let info = provider.model_info().await;
        assert_eq!(info.provider, ProviderKind::Local);
        assert_eq!(info.context_window, 8192);
        assert!(!info.loaded);
        assert_eq!(info.extra["quantization"], "q8_0");
    }

    #[tokio::test]
    async fn generate_without_load_is_rejected() {
        let provider =
            LocalProvider::from_preset(&preset(), "/models", Duration::from_secs(30), 0);
        let err = provider
            .generate(
                &TaskInput::Prompt("hi".to_string()),
                &GenerationParams::default(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn load_fails_cleanly_when_model_file_missing() {
        let provider =
            LocalProvider::from_preset(&preset(), "/nonexistent", Duration::from_secs(30), 0);
        let err = LocalControl::load(&provider).await.err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!LocalControl::is_loaded(&provider).await);
    }
}
