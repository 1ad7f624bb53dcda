//! Embedding provider over an OpenAI-compatible `/embeddings` endpoint.
//!
//! Fulfills the provider capability set for registry bookkeeping; text
//! generation is a probed-and-absent capability here, embedding generation
//! is the extension capability callers probe for.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::providers::{
    ChunkStream, EmbeddingGenerator, GenerationParams, GenerationResult, ModelInfo, Provider,
    ProviderKind, TaskInput,
};

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Provider serving one embedding model.
pub struct EmbeddingProvider {
    name: String,
    model_name: String,
    base_url: String,
    api_key: Option<String>,
    dimensions: u32,
    http: reqwest::Client,
}

impl EmbeddingProvider {
    /// Build an embedding provider.
    pub fn new(
        name: String,
        model_name: String,
        base_url: String,
        api_key: Option<String>,
        dimensions: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                Error::ProviderUnavailable(format!("cannot build HTTP client: {err}"))
            })?;
        Ok(Self {
            name,
            model_name,
            base_url,
            api_key,
            dimensions,
            http,
        })
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provider for EmbeddingProvider {
    async fn generate(
        &self,
        _input: &TaskInput,
        _params: &GenerationParams,
    ) -> Result<GenerationResult> {
        Err(Error::NotSupported {
            capability: "generate".to_string(),
        })
    }

    async fn generate_stream(
        &self,
        _input: &TaskInput,
        _params: &GenerationParams,
    ) -> Result<ChunkStream> {
        Err(Error::NotSupported {
            capability: "generate_stream".to_string(),
        })
    }

    async fn model_info(&self) -> ModelInfo {
        let mut extra = BTreeMap::new();
        extra.insert("dimensions".to_string(), Value::from(self.dimensions));
        extra.insert(
            "base_url".to_string(),
            Value::String(self.base_url.clone()),
        );
        ModelInfo {
            name: self.name.clone(),
            provider: ProviderKind::Embedding,
            context_window: 512,
            max_output_tokens: 0,
            supports_streaming: false,
            supports_structured_output: false,
            loaded: false,
            extra,
        }
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn cleanup(&self) {}

    fn embeddings(&self) -> Option<&dyn EmbeddingGenerator> {
        Some(self)
    }
}

#[async_trait]
impl EmbeddingGenerator for EmbeddingProvider {
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model_name, "input": texts });
        let mut request = self.http.post(self.embeddings_url()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let response = request.send().await.map_err(|err| {
            Error::ProviderUnavailable(format!("embedding request failed: {err}"))
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|err| {
            Error::ProviderUnavailable(format!("cannot read embedding response: {err}"))
        })?;
        if !status.is_success() {
            return Err(Error::GenerationFailed(format!(
                "embedding endpoint error {status}: {text}"
            )));
        }
        let parsed: EmbeddingsResponse = serde_json::from_str(&text).map_err(|err| {
            Error::GenerationFailed(format!("unparsable embedding response: {err}"))
        })?;
        if parsed.data.len() != texts.len() {
            return Err(Error::GenerationFailed(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider() -> EmbeddingProvider {
        EmbeddingProvider::new(
            "mini-embed".to_string(),
            "all-MiniLM-L6-v2".to_string(),
            "http://localhost:9999/v1".to_string(),
            None,
            384,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn generation_capability_is_absent() {
        let provider = provider();
        let err = provider
            .generate(
                &TaskInput::Prompt("hi".to_string()),
                &GenerationParams::default(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotSupported { .. }));
        assert!(provider.embeddings().is_some());
        assert!(provider.local_control().is_none());
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let provider = provider();
        let out = provider.generate_embeddings(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn info_reports_embedding_variant() {
        let info = provider().model_info().await;
        assert_eq!(info.provider, ProviderKind::Embedding);
        assert_eq!(info.extra["dimensions"], 384);
    }
}
