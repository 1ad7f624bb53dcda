//! Monitoring endpoints: composite health, GPU telemetry, queue counters.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::http::{ApiError, ApiResult, AppState};

/// `GET /api/v1/monitor/health`: 200 when the key-value store answers,
/// 503 otherwise; provider health is informational.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let store_healthy = state.store.health_check().await;
    let providers = state.registry.health_check_all().await;
    let gpu_reachable = state.monitor.vram_usage().await.is_ok();
    let status = if store_healthy { "healthy" } else { "degraded" };
    let code = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "components": {
                "store": store_healthy,
                "gpu": gpu_reachable,
                "providers": providers,
            },
        })),
    )
}

/// `GET /api/v1/monitor/gpu`: cached snapshot when fresh, live probe
/// otherwise; 503 when the device interface is inoperative.
pub async fn gpu(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    if let Ok(Some(cached)) = state.store.get_cached_gpu_stats().await {
        return Ok(Json(json!({ "cached": true, "stats": cached })));
    }
    let info = state.monitor.gpu_info().await.map_err(ApiError::from)?;
    let usage = state.monitor.vram_usage().await.map_err(ApiError::from)?;
    Ok(Json(json!({
        "cached": false,
        "stats": {
            "gpu_info": info,
            "vram_usage": usage,
            "is_locked": state.guard.is_locked(),
            "current_task_id": state.guard.current_task_id(),
        },
    })))
}

/// `GET /api/v1/monitor/queue`: queue counters.
pub async fn queue(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.store.get_stats().await?;
    Ok(Json(json!({
        "queue_size": stats.queue_size,
        "processing_task": stats.processing_task,
        "recent_logs_count": stats.recent_logs_count,
    })))
}

/// Query of `GET /api/v1/monitor/stats`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    /// Day to read (`YYYY-MM-DD`), today when absent.
    pub date: Option<String>,
}

/// `GET /api/v1/monitor/stats`: daily counters.
pub async fn daily_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Value>> {
    let stats = state.store.get_daily_stats(query.date.as_deref()).await?;
    Ok(Json(json!({ "date": query.date, "stats": stats })))
}
