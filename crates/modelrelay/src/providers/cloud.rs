//! Unified cloud provider: OpenAI-compatible chat completions.
//!
//! One client covers OpenAI, OpenRouter, Together and any local
//! OpenAI-compatible server (LM Studio, vLLM, Ollama). The local GGUF
//! provider reuses [`ChatCompletionsClient`] against its own child server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::providers::{
    ChatMessage, ChunkStream, FinishReason, GenerationParams, GenerationResult, ModelInfo,
    Provider, ProviderKind, StreamChunk, TaskInput, Usage,
};

/// Connection coordinates of an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct CloudEndpoint {
    /// Base URL up to and including the API version segment, e.g.
    /// `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token, when the endpoint wants one.
    pub api_key: Option<String>,
}

/// Response shape of `/chat/completions`.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub(crate) choices: Vec<Choice>,
    #[serde(default)]
    pub(crate) usage: Option<WireUsage>,
    #[serde(default)]
    pub(crate) model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: WireAssistantMessage,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAssistantMessage {
    #[serde(default)]
    pub(crate) content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub(crate) prompt_tokens: u64,
    #[serde(default)]
    pub(crate) completion_tokens: u64,
    #[serde(default)]
    pub(crate) total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        let total = if wire.total_tokens > 0 {
            wire.total_tokens
        } else {
            wire.prompt_tokens + wire.completion_tokens
        };
        Usage {
            prompt_tokens: wire.prompt_tokens,
            completion_tokens: wire.completion_tokens,
            total_tokens: total,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("length") => FinishReason::Length,
        Some("error") => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

/// HTTP client for OpenAI-compatible chat completions.
#[derive(Clone)]
pub(crate) struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: CloudEndpoint,
    max_retries: u32,
    /// Include llama.cpp-only knobs (top_k, grammar) in the body.
    local_dialect: bool,
}

impl ChatCompletionsClient {
    pub(crate) fn new(
        endpoint: CloudEndpoint,
        timeout: Duration,
        max_retries: u32,
        local_dialect: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                Error::ProviderUnavailable(format!("cannot build HTTP client: {err}"))
            })?;
        Ok(Self {
            http,
            endpoint,
            max_retries,
            local_dialect,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'))
    }

    fn request_body(
        &self,
        model: &str,
        input: &TaskInput,
        params: &GenerationParams,
        stream: bool,
    ) -> Value {
        let messages: Vec<Value> = input
            .as_messages()
            .iter()
            .map(|message: &ChatMessage| json!({ "role": message.role, "content": message.content }))
            .collect();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "top_p": params.top_p,
            "frequency_penalty": params.frequency_penalty,
            "presence_penalty": params.presence_penalty,
        });
        if let Value::Object(ref mut map) = body {
            if !params.stop_sequences.is_empty() {
                map.insert("stop".to_string(), json!(params.stop_sequences));
            }
            if let Some(seed) = params.seed {
                map.insert("seed".to_string(), json!(seed));
            }
            if let Some(response_format) = &params.response_format {
                map.insert("response_format".to_string(), response_format.clone());
            }
            if self.local_dialect {
                map.insert("top_k".to_string(), json!(params.top_k));
                if let Some(grammar) = &params.grammar {
                    map.insert("grammar".to_string(), json!(grammar));
                }
            }
            if stream {
                map.insert("stream".to_string(), json!(true));
            }
            for (key, value) in &params.extra {
                map.insert(key.clone(), value.clone());
            }
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        // Transport errors are retried; HTTP-level failures are not. The
        // idempotency key is the caller's retry primitive.
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.http.post(self.completions_url()).json(body);
            if let Some(key) = &self.endpoint.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_connect() || err.is_timeout() => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "provider transport error; retrying"
                    );
                    last_err = Some(if err.is_timeout() {
                        Error::Timeout(format!("provider request timed out: {err}"))
                    } else {
                        Error::ProviderUnavailable(format!("provider unreachable: {err}"))
                    });
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
                    }
                }
                Err(err) => {
                    return Err(Error::ProviderUnavailable(format!(
                        "provider request failed: {err}"
                    )));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::ProviderUnavailable("provider request failed for unknown reason".to_string())
        }))
    }

    fn map_status_error(status: reqwest::StatusCode, body: &str) -> Error {
        let lowered = body.to_lowercase();
        match status.as_u16() {
            401 | 403 => Error::ProviderAuthentication(format!(
                "provider rejected credentials ({status}): {body}"
            )),
            429 => Error::TokenLimitExceeded(format!("provider rate/quota limit: {body}")),
            400 | 422 if lowered.contains("context length") || lowered.contains("context_length") => {
                Error::ContextLengthExceeded(format!("prompt exceeds context window: {body}"))
            }
            500..=599 => Error::ProviderUnavailable(format!("provider error {status}: {body}")),
            _ => Error::GenerationFailed(format!("provider error {status}: {body}")),
        }
    }

    pub(crate) async fn chat(
        &self,
        model: &str,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChatCompletionResponse> {
        let body = self.request_body(model, input, params, false);
        let response = self.send(&body).await?;
        let status = response.status();
        let text = response.text().await.map_err(|err| {
            Error::ProviderUnavailable(format!("cannot read provider response: {err}"))
        })?;
        if !status.is_success() {
            return Err(Self::map_status_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|err| {
            Error::GenerationFailed(format!("unparsable provider response: {err}; body: {text}"))
        })
    }

    pub(crate) async fn chat_stream(
        &self,
        model: &str,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        let body = self.request_body(model, input, params, true);
        let response = self.send(&body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status_error(status, &text));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut finish_reason: Option<FinishReason> = None;
            let mut usage: Option<Usage> = None;
            'outer: while let Some(piece) = bytes.next().await {
                let piece = piece.map_err(|err| {
                    Error::ProviderUnavailable(format!("provider stream error: {err}"))
                })?;
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(envelope) = serde_json::from_str::<StreamEnvelope>(payload) else {
                        continue;
                    };
                    if let Some(wire_usage) = envelope.usage {
                        usage = Some(wire_usage.into());
                    }
                    for choice in envelope.choices {
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            finish_reason = Some(parse_finish_reason(Some(reason)));
                        }
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                yield StreamChunk {
                                    text: content,
                                    finish_reason: None,
                                    usage: None,
                                };
                            }
                        }
                    }
                }
            }
            yield StreamChunk {
                text: String::new(),
                finish_reason: Some(finish_reason.unwrap_or(FinishReason::Stop)),
                usage,
            };
        };
        Ok(stream.boxed())
    }

    pub(crate) async fn probe_models_endpoint(&self) -> bool {
        let url = format!("{}/models", self.endpoint.base_url.trim_end_matches('/'));
        let mut request = self.http.get(url);
        if let Some(key) = &self.endpoint.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Provider over one model at one OpenAI-compatible endpoint.
pub struct CloudProvider {
    name: String,
    model_name: String,
    client: ChatCompletionsClient,
    context_window: u32,
    max_output_tokens: u32,
}

impl CloudProvider {
    /// Build a cloud provider.
    pub fn new(
        name: String,
        model_name: String,
        endpoint: CloudEndpoint,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = ChatCompletionsClient::new(endpoint, timeout, max_retries, false)?;
        Ok(Self {
            name,
            model_name,
            client,
            context_window: 128_000,
            max_output_tokens: 16_384,
        })
    }

    fn to_result(&self, response: ChatCompletionResponse) -> Result<GenerationResult> {
        let model = response
            .model
            .clone()
            .unwrap_or_else(|| self.model_name.clone());
        let usage = response.usage.map(Usage::from).unwrap_or_default();
        let choice = response.choices.into_iter().next().ok_or_else(|| {
            Error::GenerationFailed("provider response has no choices".to_string())
        })?;
        let text = choice.message.content.unwrap_or_default();
        if text.is_empty() {
            return Err(Error::GenerationFailed(
                "provider returned an empty completion".to_string(),
            ));
        }
        Ok(GenerationResult {
            text,
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            usage,
            model,
            extra: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl Provider for CloudProvider {
    async fn generate(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<GenerationResult> {
        params.validate()?;
        let response = self.client.chat(&self.model_name, input, params).await?;
        self.to_result(response)
    }

    async fn generate_stream(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        params.validate()?;
        self.client
            .chat_stream(&self.model_name, input, params)
            .await
    }

    async fn model_info(&self) -> ModelInfo {
        let mut extra = BTreeMap::new();
        extra.insert(
            "base_url".to_string(),
            Value::String(self.client.endpoint.base_url.clone()),
        );
        extra.insert(
            "model_name".to_string(),
            Value::String(self.model_name.clone()),
        );
        ModelInfo {
            name: self.name.clone(),
            provider: ProviderKind::Cloud,
            context_window: self.context_window,
            max_output_tokens: self.max_output_tokens,
            supports_streaming: true,
            supports_structured_output: true,
            loaded: false,
            extra,
        }
    }

    async fn health_check(&self) -> bool {
        self.client.probe_models_endpoint().await
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client(local_dialect: bool) -> ChatCompletionsClient {
        ChatCompletionsClient::new(
            CloudEndpoint {
                base_url: "http://localhost:9999/v1".to_string(),
                api_key: None,
            },
            Duration::from_secs(5),
            0,
            local_dialect,
        )
        .unwrap()
    }

    #[test]
    fn body_includes_optional_fields_only_when_set() {
        let params = GenerationParams::default();
        let body = client(false).request_body(
            "gpt-4-turbo",
            &TaskInput::Prompt("hi".to_string()),
            &params,
            false,
        );
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("stop").is_none());
        assert!(body.get("seed").is_none());
        assert!(body.get("top_k").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn local_dialect_carries_top_k_and_grammar() {
        let params = GenerationParams {
            grammar: Some("root ::= \"yes\"".to_string()),
            ..GenerationParams::default()
        };
        let body = client(true).request_body(
            "local-model",
            &TaskInput::Prompt("hi".to_string()),
            &params,
            true,
        );
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["grammar"], "root ::= \"yes\"");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn status_errors_map_to_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            ChatCompletionsClient::map_status_error(StatusCode::UNAUTHORIZED, "no"),
            Error::ProviderAuthentication(_)
        ));
        assert!(matches!(
            ChatCompletionsClient::map_status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Error::TokenLimitExceeded(_)
        ));
        assert!(matches!(
            ChatCompletionsClient::map_status_error(
                StatusCode::BAD_REQUEST,
                "maximum context length exceeded"
            ),
            Error::ContextLengthExceeded(_)
        ));
        assert!(matches!(
            ChatCompletionsClient::map_status_error(StatusCode::BAD_GATEWAY, "oops"),
            Error::ProviderUnavailable(_)
        ));
    }

    #[test]
    fn finish_reason_parsing_defaults_to_stop() {
        assert_eq!(parse_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(parse_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(parse_finish_reason(None), FinishReason::Stop);
    }
}
