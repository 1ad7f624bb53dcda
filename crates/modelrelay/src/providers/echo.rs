//! Deterministic echo provider.
//!
//! Returns its input verbatim. Registered by default so smoke tests and
//! end-to-end suites can exercise the full pipeline without a model.

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::Result;
use crate::providers::{
    ChunkStream, FinishReason, GenerationParams, GenerationResult, ModelInfo,
    Provider, ProviderKind, Role, StreamChunk, TaskInput, Usage,
};

/// Name the echo provider registers under.
pub const ECHO_MODEL_NAME: &str = "echo";

/// Provider that echoes the prompt (or the last user turn) back.
pub struct EchoProvider {
    name: String,
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoProvider {
    /// Echo provider under the default name.
    pub fn new() -> Self {
        Self {
            name: ECHO_MODEL_NAME.to_string(),
        }
    }

    fn echo_text(input: &TaskInput) -> String {
        match input {
            TaskInput::Prompt(prompt) => prompt.clone(),
            TaskInput::Messages(messages) => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .or_else(|| messages.last())
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        }
    }

    fn count_tokens(text: &str) -> u64 {
        (text.split_whitespace().count() as u64).max(1)
    }

    fn result(input: &TaskInput, params: &GenerationParams) -> GenerationResult {
        let mut text = Self::echo_text(input);
        let prompt_tokens = Self::count_tokens(&text);
        let mut finish_reason = FinishReason::Stop;
        let cap = params.max_tokens as usize;
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() > cap {
            text = words[..cap].join(" ");
            finish_reason = FinishReason::Length;
        }
        let completion_tokens = Self::count_tokens(&text);
        GenerationResult {
            text,
            finish_reason,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            model: ECHO_MODEL_NAME.to_string(),
            extra: Default::default(),
        }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    async fn generate(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<GenerationResult> {
        params.validate()?;
        Ok(Self::result(input, params))
    }

    async fn generate_stream(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        params.validate()?;
        let result = Self::result(input, params);
        let words: Vec<String> = result
            .text
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect();
        let last = words.len().saturating_sub(1);
        let chunks: Vec<Result<StreamChunk>> = words
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                Ok(StreamChunk {
                    text,
                    finish_reason: (index == last).then_some(result.finish_reason),
                    usage: (index == last).then_some(result.usage),
                })
            })
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            provider: ProviderKind::Echo,
            context_window: 8192,
            max_output_tokens: 8192,
            supports_streaming: true,
            supports_structured_output: false,
            loaded: true,
            extra: Default::default(),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn cleanup(&self) {}
}
