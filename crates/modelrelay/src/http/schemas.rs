//! Wire shapes of the HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presets::{CloudModelPreset, EmbeddingModelPreset, LocalModelPreset};
use crate::providers::{GenerationResult, Role};
use crate::store::{Session, TaskError};

/// Intake-style provider override block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfigOverride {
    /// Overrides the top-level `model` field.
    pub model_name: Option<String>,
}

/// One inline chat message of a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageIn {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
}

/// Body of `POST /api/v1/tasks/`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateTaskRequest {
    /// Target model.
    pub model: Option<String>,
    /// Prompt text (exclusive with `messages` as the primary input).
    pub prompt: Option<String>,
    /// Explicit dialogue (wins over `prompt`).
    pub messages: Option<Vec<MessageIn>>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token cap.
    pub max_tokens: Option<u32>,
    /// Nucleus threshold.
    pub top_p: Option<f64>,
    /// Top-K sampling.
    pub top_k: Option<u32>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Early-termination sequences.
    pub stop_sequences: Option<Vec<String>>,
    /// Reproducibility seed.
    pub seed: Option<i64>,
    /// Structured-output schema.
    pub response_format: Option<Value>,
    /// GBNF grammar for local inference.
    pub grammar: Option<String>,
    /// Streaming hint; events are wired either way, the HTTP response is
    /// non-streaming.
    pub stream: Option<bool>,
    /// Completion callback URL.
    pub webhook_url: Option<String>,
    /// At-most-one-task token.
    pub idempotency_key: Option<String>,
    /// Queue priority; higher pops first.
    pub priority: Option<f64>,
    /// Attached conversation.
    pub conversation_id: Option<String>,
    /// Whether the turn is written back to the conversation.
    pub save_to_conversation: Option<bool>,
    /// Provider-specific passthrough.
    pub extra_params: Option<BTreeMap<String, Value>>,
    /// Intake compatibility: `provider_config.model_name` overrides `model`.
    pub provider_config: Option<ProviderConfigOverride>,
    /// Intake compatibility: alias of `response_format`.
    pub output_schema: Option<Value>,
    /// Intake compatibility: appended to `prompt` after a blank line.
    pub input_text: Option<String>,
}

/// Task representation returned by the tasks endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    /// Task id.
    pub task_id: String,
    /// Lifecycle state.
    pub status: String,
    /// Target model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Queue priority.
    pub priority: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Dispatch time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Completion callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Idempotency token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Attached conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Present when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
    /// Present when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl From<Session> for TaskResponse {
    fn from(session: Session) -> Self {
        Self {
            task_id: session.task_id,
            status: session.status.as_str().to_string(),
            model: session.model,
            priority: session.priority,
            created_at: session.created_at,
            updated_at: session.updated_at,
            started_at: session.started_at,
            finished_at: session.finished_at,
            webhook_url: session.webhook_url,
            idempotency_key: session.idempotency_key,
            conversation_id: session.conversation_id,
            result: session.result,
            error: session.error,
        }
    }
}

/// Body of `POST /api/v1/models/register`: exactly one preset family.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegisterModelRequest {
    /// Local GGUF preset.
    pub local: Option<LocalModelPreset>,
    /// Cloud preset.
    pub cloud: Option<CloudModelPreset>,
    /// Embedding preset.
    pub embedding: Option<EmbeddingModelPreset>,
}

/// Body of `POST /api/v1/models/register-from-preset`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterFromPresetRequest {
    /// Preset name to instantiate.
    pub name: String,
}

/// Body of `POST /api/v1/models/check-compatibility`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckCompatibilityRequest {
    /// Local preset name.
    pub name: String,
    /// Quantization override; parsed from the filename when absent.
    #[serde(default)]
    pub quantization: Option<String>,
}

/// Body of `POST /api/v1/models/load` and `/unload`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelResidencyRequest {
    /// Model name.
    pub model: String,
}

/// Query of `DELETE /api/v1/models/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnregisterModelQuery {
    /// Run the provider's cleanup while unregistering (default true).
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

fn default_true() -> bool {
    true
}

/// Body of `POST /api/v1/conversations/`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateConversationRequest {
    /// Default model for the conversation.
    pub model: Option<String>,
    /// System prompt, mirrored as the first message.
    pub system_prompt: Option<String>,
    /// Caller-attached metadata.
    pub metadata: Option<Value>,
}

/// Body of `POST /api/v1/conversations/{id}/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct AddMessageRequest {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
}

/// Query of `GET /api/v1/conversations/{id}/messages`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagesQuery {
    /// Return only the newest N messages.
    pub limit: Option<u64>,
}
