//! modelrelay: a single-host LLM execution gateway.
//!
//! Accepts text-generation requests over HTTP, queues them with priority
//! and idempotency in a key-value store, dispatches each to a backend
//! provider under a strict exclusive-GPU discipline, streams lifecycle
//! events to WebSocket subscribers, and delivers completion webhooks.
//!
//! - **store**: sessions, priority queue, idempotency index, log rings
//! - **dispatch**: the single-worker lifecycle owner + webhook delivery
//! - **providers**: capability set, registry, local/cloud/embedding backends
//! - **gpu**: exclusive guard, VRAM monitor, telemetry ticker
//! - **http**: the `/api/v1` facade and the `/ws/monitor` fan-out

pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod http;
pub mod observability;
pub mod presets;
pub mod providers;
pub mod store;

pub use config::Settings;
pub use dispatch::{Dispatcher, SubmitTask, WebhookDelivery};
pub use error::{Error, ErrorBody, Result};
pub use gpu::{GpuGuard, VramMonitor};
pub use providers::{
    ChatMessage, GenerationParams, GenerationResult, ModelInfo, Provider, ProviderRegistry, Role,
    TaskInput,
};
pub use store::{ConversationStore, Session, TaskStatus, TaskStore};
