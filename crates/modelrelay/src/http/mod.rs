//! HTTP facade: router, shared state, error mapping.
//!
//! Handlers translate the external request shape into internal calls and
//! map the error taxonomy onto status codes with a
//! `{error_code, message, details?}` body.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use modelrelay_events::EventBus;

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::gpu::{GpuGuard, VramMonitor};
use crate::presets::ModelDefaultsCatalog;
use crate::providers::{ModelResidency, ProviderRegistry};
use crate::store::{ConversationStore, TaskStore};

pub mod adapter;
pub mod conversations;
pub mod models;
pub mod monitor;
pub mod schemas;
pub mod tasks;
pub mod ws;

/// Everything the handlers need, injected at construction (no globals).
#[derive(Clone)]
pub struct AppState {
    /// Runtime settings.
    pub settings: Arc<Settings>,
    /// Task store.
    pub store: Arc<TaskStore>,
    /// Conversation store.
    pub conversations: Arc<ConversationStore>,
    /// Provider registry.
    pub registry: Arc<ProviderRegistry>,
    /// Local model residency manager.
    pub residency: Arc<ModelResidency>,
    /// Task lifecycle owner.
    pub dispatcher: Arc<Dispatcher>,
    /// Exclusive GPU guard.
    pub guard: Arc<GpuGuard>,
    /// VRAM monitor.
    pub monitor: Arc<VramMonitor>,
    /// Event fan-out bus.
    pub bus: EventBus,
    /// Per-model parameter defaults.
    pub defaults: Arc<ModelDefaultsCatalog>,
}

/// Transport wrapper turning [`Error`] into an HTTP response.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self.0.to_body())).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks/", post(tasks::create_task))
        .route(
            "/tasks/{task_id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/tasks/{task_id}/report", get(tasks::get_task_report))
        .route("/models/", get(models::list_models))
        .route("/models/register", post(models::register_model))
        .route(
            "/models/register-from-preset",
            post(models::register_from_preset),
        )
        .route(
            "/models/check-compatibility",
            post(models::check_compatibility),
        )
        .route("/models/load", post(models::load_model))
        .route("/models/unload", post(models::unload_model))
        .route(
            "/models/{name}",
            get(models::get_model).delete(models::unregister_model),
        )
        .route("/conversations/", post(conversations::create_conversation))
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation)
                .patch(conversations::update_conversation)
                .delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(conversations::add_message)
                .get(conversations::get_messages)
                .delete(conversations::clear_messages),
        )
        .route("/monitor/health", get(monitor::health))
        .route("/monitor/gpu", get(monitor::gpu))
        .route("/monitor/queue", get(monitor::queue))
        .route("/monitor/stats", get(monitor::daily_stats));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws/monitor", get(ws::ws_monitor))
        .with_state(state)
}
