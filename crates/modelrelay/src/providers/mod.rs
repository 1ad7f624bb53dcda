//! Provider capability set and shared generation types.
//!
//! A provider fulfills `{generate, generate_stream, model_info,
//! health_check, cleanup}` for one model. Variant-specific abilities
//! (local load/unload, embeddings) are extension capabilities a caller
//! probes for; an absent probe means `not-supported`.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub mod cloud;
pub mod echo;
pub mod embedding;
pub mod local;
pub mod registry;
pub mod residency;

pub use cloud::{CloudEndpoint, CloudProvider};
pub use echo::EchoProvider;
pub use embedding::EmbeddingProvider;
pub use local::LocalProvider;
pub use registry::ProviderRegistry;
pub use residency::ModelResidency;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions injected ahead of the dialogue.
    System,
    /// End-user turn.
    User,
    /// Model reply.
    Assistant,
}

/// One message of a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Set when the message was persisted to a conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Build an unpersisted message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }
}

/// What a task asks the model to continue: a bare prompt or a dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    /// Ordered chat messages.
    Messages(Vec<ChatMessage>),
    /// Single prompt string.
    Prompt(String),
}

impl TaskInput {
    /// View the input as chat messages (a prompt becomes one user turn).
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        match self {
            TaskInput::Messages(messages) => messages.clone(),
            TaskInput::Prompt(prompt) => vec![ChatMessage::new(Role::User, prompt.clone())],
        }
    }

    /// The raw prompt when this input is prompt-shaped.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            TaskInput::Prompt(prompt) => Some(prompt.as_str()),
            TaskInput::Messages(_) => None,
        }
    }
}

/// Generation knobs, OpenAI-compatible where the fields overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Sampling softness; 0.0 is near-deterministic.
    pub temperature: f64,
    /// Output token cap.
    pub max_tokens: u32,
    /// Nucleus sampling threshold.
    pub top_p: f64,
    /// Top-K sampling; 0 disables.
    pub top_k: u32,
    /// Token-frequency repetition penalty.
    pub frequency_penalty: f64,
    /// Token-presence repetition penalty.
    pub presence_penalty: f64,
    /// Early-termination sequences.
    pub stop_sequences: Vec<String>,
    /// Seed for reproducibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// JSON schema for structured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    /// GBNF grammar constraint for local inference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// Provider-specific passthrough.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 2048,
            top_p: 1.0,
            top_k: 40,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop_sequences: Vec::new(),
            seed: None,
            response_format: None,
            grammar: None,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    /// Range-check every knob; the documented ranges are the contract.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Validation(format!(
                "temperature must be in [0.0, 2.0], got {}",
                self.temperature
            )));
        }
        if self.max_tokens < 1 {
            return Err(Error::Validation("max_tokens must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::Validation(format!(
                "top_p must be in [0.0, 1.0], got {}",
                self.top_p
            )));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(Error::Validation(format!(
                "frequency_penalty must be in [-2.0, 2.0], got {}",
                self.frequency_penalty
            )));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(Error::Validation(format!(
                "presence_penalty must be in [-2.0, 2.0], got {}",
                self.presence_penalty
            )));
        }
        Ok(())
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Natural stop or stop sequence.
    Stop,
    /// Output cap reached.
    Length,
    /// Provider-side failure mid-generation.
    Error,
}

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the rendered input.
    pub prompt_tokens: u64,
    /// Tokens produced.
    pub completion_tokens: u64,
    /// Sum of the above.
    pub total_tokens: u64,
}

/// Result of a completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text.
    pub text: String,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token accounting.
    pub usage: Usage,
    /// Model that produced the text.
    pub model: String,
    /// Provider-specific metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// One chunk of a streamed generation; the last chunk carries the finish
/// reason and usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text delta.
    pub text: String,
    /// Present only on the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Present only on the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Provider variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// GGUF inference on this host.
    Local,
    /// Unified OpenAI-compatible cloud client.
    Cloud,
    /// Embedding-only backend.
    Embedding,
    /// Deterministic test backend.
    Echo,
}

/// Static model metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Registry name.
    pub name: String,
    /// Provider variant.
    pub provider: ProviderKind,
    /// Context window in tokens.
    pub context_window: u32,
    /// Output cap in tokens.
    pub max_output_tokens: u32,
    /// Whether `generate_stream` is implemented natively.
    pub supports_streaming: bool,
    /// Whether structured output (schema/grammar) is honored.
    pub supports_structured_output: bool,
    /// Whether the model currently occupies memory/VRAM.
    pub loaded: bool,
    /// Provider-specific metadata (VRAM, quantization, endpoint).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Boxed stream of generation chunks. Finite, not restartable.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// The capability set the dispatcher requires from any backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate text; synchronous from the caller's view, may run minutes.
    async fn generate(&self, input: &TaskInput, params: &GenerationParams)
    -> Result<GenerationResult>;

    /// Generate text as a lazy chunk sequence.
    async fn generate_stream(
        &self,
        input: &TaskInput,
        params: &GenerationParams,
    ) -> Result<ChunkStream>;

    /// Static model metadata.
    async fn model_info(&self) -> ModelInfo;

    /// Whether the backend is reachable/operational.
    async fn health_check(&self) -> bool;

    /// Idempotent release of external resources.
    async fn cleanup(&self);

    /// Probe for the local load/unload capability.
    fn local_control(&self) -> Option<&dyn LocalControl> {
        None
    }

    /// Probe for the embedding capability.
    fn embeddings(&self) -> Option<&dyn EmbeddingGenerator> {
        None
    }
}

/// Extension capability: residency control for local models.
#[async_trait]
pub trait LocalControl: Send + Sync {
    /// Bring the model into VRAM; idempotent.
    async fn load(&self) -> Result<()>;

    /// Release the model from VRAM; idempotent.
    async fn unload(&self) -> Result<()>;

    /// Whether the model is currently resident.
    async fn is_loaded(&self) -> bool;

    /// VRAM the model needs to become resident, in MB.
    fn required_vram_mb(&self) -> u64;
}

/// Extension capability: embedding generation.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn params_defaults_are_in_range() {
        GenerationParams::default().validate().unwrap();
    }

    #[test]
    fn params_reject_out_of_range_temperature() {
        let params = GenerationParams {
            temperature: 3.0,
            ..GenerationParams::default()
        };
        assert!(matches!(params.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn task_input_roundtrips_untagged() {
        let prompt: TaskInput = serde_json::from_value(serde_json::json!("hello")).unwrap();
        assert_eq!(prompt.prompt(), Some("hello"));

        let messages: TaskInput = serde_json::from_value(serde_json::json!([
            {"role": "user", "content": "hi"}
        ]))
        .unwrap();
        assert_eq!(messages.as_messages().len(), 1);
        assert!(messages.prompt().is_none());
    }

    #[test]
    fn prompt_becomes_single_user_turn() {
        let input = TaskInput::Prompt("what is rust".to_string());
        let messages = input.as_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
