//! Webhook delivery against a local stub: retry on non-2xx, bounded
//! attempts, best-effort outcome.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use modelrelay::dispatch::WebhookDelivery;
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone)]
struct StubState {
    hits: Arc<AtomicU32>,
    failures_before_success: u32,
    last_payload: Arc<tokio::sync::Mutex<Option<Value>>>,
}

async fn stub_hook(
    State(state): State<StubState>,
    Json(payload): Json<Value>,
) -> (StatusCode, &'static str) {
    let attempt = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_payload.lock().await = Some(payload);
    if attempt <= state.failures_before_success {
        (StatusCode::INTERNAL_SERVER_ERROR, "try again")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// Spawn a one-route stub server; returns its URL and the shared state.
async fn spawn_stub(failures_before_success: u32) -> (String, StubState) {
    let state = StubState {
        hits: Arc::new(AtomicU32::new(0)),
        failures_before_success,
        last_payload: Arc::new(tokio::sync::Mutex::new(None)),
    };
    let app = Router::new()
        .route("/hook", post(stub_hook))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/hook"), state)
}

#[tokio::test]
async fn delivers_on_first_success() {
    let (url, state) = spawn_stub(0).await;
    let delivery = WebhookDelivery::new(Duration::from_secs(1), 3).unwrap();
    let delivered = delivery
        .deliver("task-1", &url, "completed", json!({"text": "hi"}))
        .await;
    assert!(delivered);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    let payload = state.last_payload.lock().await.clone().unwrap();
    assert_eq!(payload["task_id"], "task-1");
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["data"]["text"], "hi");
}

#[tokio::test]
async fn retries_through_failures_then_succeeds() {
    // 500, 500, 200 -> exactly three POSTs.
    let (url, state) = spawn_stub(2).await;
    let delivery = WebhookDelivery::new(Duration::from_secs(1), 2).unwrap();
    let delivered = delivery
        .deliver("task-2", &url, "completed", json!({}))
        .await;
    assert!(delivered);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn attempts_are_bounded_at_one_plus_max_retries() {
    let (url, state) = spawn_stub(u32::MAX).await;
    let delivery = WebhookDelivery::new(Duration::from_secs(1), 1).unwrap();
    let delivered = delivery.deliver("task-3", &url, "failed", json!({})).await;
    assert!(!delivered);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_url_fails_without_panicking() {
    let delivery = WebhookDelivery::new(Duration::from_millis(200), 0).unwrap();
    let delivered = delivery
        .deliver("task-4", "http://127.0.0.1:1/hook", "failed", json!({}))
        .await;
    assert!(!delivered);
}
