//! Model endpoints: listing, registration, residency, compatibility.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::error::Error;
use crate::http::schemas::{
    CheckCompatibilityRequest, ModelResidencyRequest, RegisterFromPresetRequest,
    RegisterModelRequest, UnregisterModelQuery,
};
use crate::http::{ApiResult, AppState};
use crate::presets::{CompatibilityChecker, ResolvedPreset};
use crate::providers::ModelInfo;

/// `GET /api/v1/models/`: registered providers plus known preset names.
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let registered = state.registry.get_all_models_info().await;
    let presets = state.registry.catalog().names();
    Ok(Json(json!({
        "registered": registered,
        "presets": presets,
        "default_provider": state.settings.default_provider,
    })))
}

/// `GET /api/v1/models/{name}`: metadata; lazily creates from a preset.
pub async fn get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ModelInfo>> {
    let provider = state.registry.get_or_create(&name).await?;
    Ok(Json(provider.model_info().await))
}

/// `POST /api/v1/models/register`: explicit registration from an inline
/// preset; the preset also joins the catalog so the model survives
/// unregister-then-lazy-create.
pub async fn register_model(
    State(state): State<AppState>,
    Json(request): Json<RegisterModelRequest>,
) -> ApiResult<(StatusCode, Json<ModelInfo>)> {
    let preset = match (request.local, request.cloud, request.embedding) {
        (Some(local), None, None) => ResolvedPreset::Local(local),
        (None, Some(cloud), None) => ResolvedPreset::Cloud(cloud),
        (None, None, Some(embedding)) => ResolvedPreset::Embedding(embedding),
        _ => {
            return Err(Error::Validation(
                "exactly one of 'local', 'cloud', 'embedding' must be provided".to_string(),
            )
            .into());
        }
    };
    let name = match &preset {
        ResolvedPreset::Local(p) => p.name.clone(),
        ResolvedPreset::Cloud(p) => p.name.clone(),
        ResolvedPreset::Embedding(p) => p.name.clone(),
    };
    let provider = state.registry.build_from_preset(&preset)?;
    state.registry.register(&name, Arc::clone(&provider)).await?;
    match preset {
        ResolvedPreset::Local(p) => state.registry.catalog().register_local(p),
        ResolvedPreset::Cloud(p) => state.registry.catalog().register_cloud(p),
        ResolvedPreset::Embedding(p) => state.registry.catalog().register_embedding(p),
    }
    Ok((StatusCode::CREATED, Json(provider.model_info().await)))
}

/// `DELETE /api/v1/models/{name}`: unregister, optionally skipping cleanup.
pub async fn unregister_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<UnregisterModelQuery>,
) -> ApiResult<StatusCode> {
    let _ = state.residency.unload(&name).await;
    state.registry.unregister(&name, query.cleanup).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/models/register-from-preset`: instantiate a catalog entry.
pub async fn register_from_preset(
    State(state): State<AppState>,
    Json(request): Json<RegisterFromPresetRequest>,
) -> ApiResult<(StatusCode, Json<ModelInfo>)> {
    if state.registry.get(&request.name).await.is_ok() {
        return Err(Error::Conflict(format!(
            "model '{}' is already registered",
            request.name
        ))
        .into());
    }
    if !state.registry.catalog().contains(&request.name) {
        return Err(Error::NotFound(format!("preset '{}' not found", request.name)).into());
    }
    let provider = state.registry.get_or_create(&request.name).await?;
    Ok((StatusCode::CREATED, Json(provider.model_info().await)))
}

/// `POST /api/v1/models/check-compatibility`: VRAM fit and quantization
/// recommendation for a local preset.
pub async fn check_compatibility(
    State(state): State<AppState>,
    Json(request): Json<CheckCompatibilityRequest>,
) -> ApiResult<Json<Value>> {
    let preset = state
        .registry
        .catalog()
        .local_preset(&request.name)
        .ok_or_else(|| Error::NotFound(format!("local preset '{}' not found", request.name)))?;
    let checker = CompatibilityChecker::new(&state.monitor);
    let result = checker
        .check(&preset, request.quantization.as_deref())
        .await;
    Ok(Json(json!({
        "model": preset.name,
        "compatibility": result,
    })))
}

/// `POST /api/v1/models/load`: make a local model resident now.
pub async fn load_model(
    State(state): State<AppState>,
    Json(request): Json<ModelResidencyRequest>,
) -> ApiResult<Json<Value>> {
    let provider = state.registry.get_or_create(&request.model).await?;
    if provider.local_control().is_none() {
        return Err(Error::Validation(format!(
            "model '{}' is not a local model",
            request.model
        ))
        .into());
    }
    state
        .residency
        .ensure_resident(&request.model, &provider)
        .await?;
    Ok(Json(json!({
        "model": request.model,
        "loaded": true,
        "resident": state.residency.list_resident().await,
    })))
}

/// `POST /api/v1/models/unload`: release a resident local model.
pub async fn unload_model(
    State(state): State<AppState>,
    Json(request): Json<ModelResidencyRequest>,
) -> ApiResult<Json<Value>> {
    let provider = state.registry.get(&request.model).await?;
    let was_resident = state.residency.unload(&request.model).await?;
    if !was_resident {
        // Registered but tracked nowhere; make unload authoritative anyway.
        if let Some(control) = provider.local_control() {
            control.unload().await?;
        }
    }
    Ok(Json(json!({
        "model": request.model,
        "loaded": false,
        "resident": state.residency.list_resident().await,
    })))
}
