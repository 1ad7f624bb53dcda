//! Conversation endpoints: CRUD plus message history.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::error::Error;
use crate::http::schemas::{AddMessageRequest, CreateConversationRequest, MessagesQuery};
use crate::http::{ApiResult, AppState};
use crate::store::conversation::{Conversation, ConversationPatch};

/// `POST /api/v1/conversations/`.
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state
        .conversations
        .create_conversation(request.model, request.system_prompt, request.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// `GET /api/v1/conversations/{conversation_id}`.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .conversations
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation '{conversation_id}' not found")))?;
    Ok(Json(conversation))
}

/// `PATCH /api/v1/conversations/{conversation_id}`.
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(patch): Json<ConversationPatch>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .conversations
        .update_conversation(&conversation_id, &patch)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation '{conversation_id}' not found")))?;
    Ok(Json(conversation))
}

/// `DELETE /api/v1/conversations/{conversation_id}`.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .conversations
        .delete_conversation(&conversation_id)
        .await?;
    if !deleted {
        return Err(
            Error::NotFound(format!("conversation '{conversation_id}' not found")).into(),
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/conversations/{conversation_id}/messages`.
pub async fn add_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<AddMessageRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.content.trim().is_empty() {
        return Err(Error::Validation("message content must be non-empty".to_string()).into());
    }
    let added = state
        .conversations
        .add_message(&conversation_id, request.role, &request.content)
        .await?;
    if !added {
        return Err(
            Error::NotFound(format!("conversation '{conversation_id}' not found")).into(),
        );
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "conversation_id": conversation_id, "role": request.role })),
    ))
}

/// `GET /api/v1/conversations/{conversation_id}/messages`.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    if state
        .conversations
        .get_conversation(&conversation_id)
        .await?
        .is_none()
    {
        return Err(
            Error::NotFound(format!("conversation '{conversation_id}' not found")).into(),
        );
    }
    let messages = state
        .conversations
        .get_messages(&conversation_id, query.limit)
        .await?;
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "messages": messages,
    })))
}

/// `DELETE /api/v1/conversations/{conversation_id}/messages`.
pub async fn clear_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<StatusCode> {
    let cleared = state.conversations.clear_messages(&conversation_id).await?;
    if !cleared {
        return Err(
            Error::NotFound(format!("conversation '{conversation_id}' not found")).into(),
        );
    }
    Ok(StatusCode::NO_CONTENT)
}
