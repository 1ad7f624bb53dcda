//! Task endpoints: submit, inspect, delete, report.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::dispatch::SubmitTask;
use crate::error::Error;
use crate::http::adapter::adapt_request;
use crate::http::schemas::{CreateTaskRequest, TaskResponse};
use crate::http::{ApiResult, AppState};
use crate::store::TaskStatus;

/// `POST /api/v1/tasks/`: adapt, validate, submit, echo the session.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let adapted = adapt_request(&request, &state.defaults)?;

    let mut model = adapted.model;
    if let Some(conversation_id) = &request.conversation_id {
        let conversation = state
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("conversation '{conversation_id}' not found"))
            })?;
        if model.is_none() {
            model = conversation.model;
        }
    }
    if model.is_none() {
        return Err(Error::Validation(
            "model is required (in the request or on the conversation)".to_string(),
        )
        .into());
    }

    let task_id = state
        .dispatcher
        .submit_task(SubmitTask {
            model,
            input: adapted.input,
            params: adapted.params,
            webhook_url: request.webhook_url.clone(),
            idempotency_key: request.idempotency_key.clone(),
            priority: request.priority.unwrap_or(0.0),
            conversation_id: request.conversation_id.clone(),
            save_to_conversation: request.save_to_conversation.unwrap_or(true),
            stream: adapted.stream,
        })
        .await?;

    let session = state
        .store
        .get_session(&task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task '{task_id}' vanished after creation")))?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// `GET /api/v1/tasks/{task_id}`: status plus inline result or error.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let session = state
        .store
        .get_session(&task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task '{task_id}' not found")))?;
    Ok(Json(session.into()))
}

/// `DELETE /api/v1/tasks/{task_id}`: only terminal tasks may be deleted.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = state
        .store
        .get_session(&task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task '{task_id}' not found")))?;
    if !session.status.is_terminal() {
        return Err(Error::Conflict(format!(
            "task '{task_id}' is '{}'; only terminal tasks can be deleted",
            session.status
        ))
        .into());
    }
    state.store.delete_session(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/tasks/{task_id}/report`: timings, token counts, logs.
pub async fn get_task_report(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state
        .store
        .get_session(&task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task '{task_id}' not found")))?;
    let logs = state.store.get_logs(&task_id).await?;

    let mut metrics = serde_json::Map::new();
    if let Some(queue_wait) = elapsed_ms(Some(session.created_at), session.started_at) {
        metrics.insert("queue_wait_ms".to_string(), json!(queue_wait));
    }
    if let Some(inference) = elapsed_ms(session.started_at, session.finished_at) {
        metrics.insert("inference_ms".to_string(), json!(inference));
    }
    if let Some(total) = elapsed_ms(Some(session.created_at), session.finished_at) {
        metrics.insert("total_ms".to_string(), json!(total));
    }

    let tokens = session
        .result
        .as_ref()
        .map(|result| {
            json!({
                "prompt_tokens": result.usage.prompt_tokens,
                "completion_tokens": result.usage.completion_tokens,
                "total_tokens": result.usage.total_tokens,
            })
        })
        .unwrap_or_else(|| json!({}));

    Ok(Json(json!({
        "task_id": session.task_id,
        "status": session.status.as_str(),
        "model": session.model,
        "created_at": session.created_at,
        "started_at": session.started_at,
        "finished_at": session.finished_at,
        "metrics": Value::Object(metrics),
        "tokens": tokens,
        "input": session.input,
        "params": session.params,
        "result": (session.status == TaskStatus::Completed)
            .then_some(&session.result)
            .and_then(|r| r.as_ref()),
        "error": (session.status == TaskStatus::Failed)
            .then_some(&session.error)
            .and_then(|e| e.as_ref()),
        "webhook_url": session.webhook_url,
        "idempotency_key": session.idempotency_key,
        "conversation_id": session.conversation_id,
        "logs": logs,
    })))
}

fn elapsed_ms(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<i64> {
    match (from, to) {
        (Some(from), Some(to)) => Some((to - from).num_milliseconds().max(0)),
        _ => None,
    }
}
