//! WebSocket monitor: per-subscriber event fan-out with filters.
//!
//! Each connection owns a broadcast receiver and applies its own
//! subscription set (default `*`, prefix wildcards honored) and optional
//! task filter. Control frames mutate that state or answer queries; every
//! reply keeps the `{type, timestamp, data}` envelope. A subscriber that
//! falls behind the bus loses the overwritten events and is torn down;
//! a slow socket never stalls the broadcaster.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use modelrelay_events::{GatewayEvent, kind_matches, kinds};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::http::AppState;
use crate::http::schemas::TaskResponse;
use crate::observability::LogEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_ERRORS_LIMIT: u64 = 50;

/// Control frames a subscriber may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Subscribe {
        #[serde(default)]
        events: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        events: Vec<String>,
    },
    FilterTask {
        task_id: Option<String>,
    },
    Ping,
    GetQueueStats,
    GetStats,
    GetTask {
        task_id: String,
    },
    GetErrors {
        #[serde(default)]
        limit: Option<u64>,
    },
    GetActiveTasks,
}

/// `GET /ws/monitor`: upgrade into the monitor protocol.
pub async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct SubscriberState {
    connection_id: String,
    subscriptions: HashSet<String>,
    task_filter: Option<String>,
}

impl SubscriberState {
    fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            subscriptions: HashSet::from(["*".to_string()]),
            task_filter: None,
        }
    }

    fn should_send(&self, event: &GatewayEvent) -> bool {
        if !kind_matches(&self.subscriptions, &event.kind) {
            return false;
        }
        // Events without a task id (gpu_stats, model.*) pass any filter.
        match (&self.task_filter, &event.task_id) {
            (Some(filter), Some(task_id)) => filter == task_id,
            _ => true,
        }
    }
}

fn frame(kind: &str, data: Value) -> Message {
    let event = GatewayEvent::new(kind, data);
    Message::Text(
        serde_json::to_string(&event)
            .unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
            .into(),
    )
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4().to_string();
    let mut rx = state.bus.subscribe();
    let mut subscriber = SubscriberState::new(connection_id.clone());
    tracing::info!(
        event = LogEvent::WsConnected.as_str(),
        connection_id = %connection_id,
        subscribers = state.bus.subscriber_count(),
        "monitor subscriber connected"
    );

    let hello = frame(
        kinds::CONNECTED,
        json!({
            "connection_id": connection_id,
            "available_events": kinds::SUBSCRIBABLE,
        }),
    );
    if sender.send(hello).await.is_err() {
        return;
    }
    // Initial state snapshot so dashboards render before the first tick.
    if let Ok(stats) = state.store.get_stats().await {
        let cached_gpu = state.store.get_cached_gpu_stats().await.ok().flatten();
        let initial = frame(
            kinds::INITIAL,
            json!({ "queue": stats, "gpu": cached_gpu }),
        );
        if sender.send(initial).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if !subscriber.should_send(&event) {
                        continue;
                    }
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        event = LogEvent::WsLagged.as_str(),
                        connection_id = %subscriber.connection_id,
                        missed,
                        "subscriber lagged behind the bus; closing"
                    );
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if handle_control(&mut sender, &state, &mut subscriber, &text)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = heartbeat.tick() => {
                if sender.send(frame(kinds::HEARTBEAT, json!({}))).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(
        event = LogEvent::WsDisconnected.as_str(),
        connection_id = %subscriber.connection_id,
        "monitor subscriber disconnected"
    );
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &Arc<GatewayEvent>,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event.as_ref())
        .unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
    sender.send(Message::Text(payload.into())).await
}

async fn handle_control(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    subscriber: &mut SubscriberState,
    text: &str,
) -> Result<(), axum::Error> {
    let control: ControlMessage = match serde_json::from_str(text) {
        Ok(control) => control,
        Err(_) => {
            return sender
                .send(frame(
                    kinds::ERROR,
                    json!({ "message": "invalid control message" }),
                ))
                .await;
        }
    };

    match control {
        ControlMessage::Subscribe { events } => {
            let events = if events.is_empty() {
                vec!["*".to_string()]
            } else {
                events
            };
            subscriber.subscriptions = events.iter().cloned().collect();
            tracing::debug!(
                event = LogEvent::WsSubscriptionChanged.as_str(),
                connection_id = %subscriber.connection_id,
                ?events,
                "subscription replaced"
            );
            sender
                .send(frame(kinds::SUBSCRIBED, json!({ "events": events })))
                .await
        }
        ControlMessage::Unsubscribe { events } => {
            for event in &events {
                subscriber.subscriptions.remove(event);
            }
            sender
                .send(frame(kinds::UNSUBSCRIBED, json!({ "events": events })))
                .await
        }
        ControlMessage::FilterTask { task_id } => {
            subscriber.task_filter = task_id.clone();
            sender
                .send(frame(kinds::FILTER_SET, json!({ "task_id": task_id })))
                .await
        }
        ControlMessage::Ping => sender.send(frame(kinds::PONG, json!({}))).await,
        ControlMessage::GetQueueStats => {
            let data = match state.store.get_stats().await {
                Ok(stats) => json!(stats),
                Err(err) => {
                    return sender
                        .send(frame(kinds::ERROR, json!({ "message": err.to_string() })))
                        .await;
                }
            };
            sender.send(frame(kinds::QUEUE_STATS, data)).await
        }
        ControlMessage::GetStats => {
            let queue = state.store.get_stats().await.ok();
            let daily = state.store.get_daily_stats(None).await.unwrap_or_default();
            sender
                .send(frame(
                    kinds::STATS,
                    json!({ "queue": queue, "daily": daily }),
                ))
                .await
        }
        ControlMessage::GetTask { task_id } => match state.store.get_session(&task_id).await {
            Ok(Some(session)) => {
                let response: TaskResponse = session.into();
                sender.send(frame(kinds::TASK, json!(response))).await
            }
            Ok(None) => {
                sender
                    .send(frame(
                        kinds::ERROR,
                        json!({ "message": format!("task '{task_id}' not found") }),
                    ))
                    .await
            }
            Err(err) => {
                sender
                    .send(frame(kinds::ERROR, json!({ "message": err.to_string() })))
                    .await
            }
        },
        ControlMessage::GetErrors { limit } => {
            let limit = limit.unwrap_or(DEFAULT_ERRORS_LIMIT);
            let errors: Vec<_> = state
                .store
                .get_recent_logs(state.settings.logs_max_recent)
                .await
                .unwrap_or_default()
                .into_iter()
                .filter(|entry| entry.level.eq_ignore_ascii_case("error"))
                .rev()
                .take(limit as usize)
                .collect();
            sender
                .send(frame(kinds::ERRORS, json!({ "errors": errors })))
                .await
        }
        ControlMessage::GetActiveTasks => {
            let processing = state.store.get_processing().await.ok().flatten();
            let queue_size = state.store.queue_size().await.unwrap_or(0);
            sender
                .send(frame(
                    kinds::ACTIVE_TASKS,
                    json!({ "processing": processing, "queue_size": queue_size }),
                ))
                .await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_subscription_is_wildcard() {
        let subscriber = SubscriberState::new("c1".to_string());
        let event = GatewayEvent::for_task(kinds::TASK_QUEUED, "t1", json!({}));
        assert!(subscriber.should_send(&event));
    }

    #[test]
    fn task_filter_drops_other_tasks_but_not_global_events() {
        let mut subscriber = SubscriberState::new("c1".to_string());
        subscriber.task_filter = Some("t1".to_string());

        let mine = GatewayEvent::for_task(kinds::TASK_STARTED, "t1", json!({}));
        let other = GatewayEvent::for_task(kinds::TASK_STARTED, "t2", json!({}));
        let global = GatewayEvent::new(kinds::GPU_STATS, json!({}));
        assert!(subscriber.should_send(&mine));
        assert!(!subscriber.should_send(&other));
        assert!(subscriber.should_send(&global));
    }

    #[test]
    fn prefix_subscription_filters_kinds() {
        let mut subscriber = SubscriberState::new("c1".to_string());
        subscriber.subscriptions = ["task.*".to_string()].into();
        let task_event = GatewayEvent::for_task(kinds::TASK_COMPLETED, "t1", json!({}));
        let gpu_event = GatewayEvent::new(kinds::GPU_STATS, json!({}));
        assert!(subscriber.should_send(&task_event));
        assert!(!subscriber.should_send(&gpu_event));
    }

    #[test]
    fn control_messages_deserialize() {
        let subscribe: ControlMessage =
            serde_json::from_str(r#"{"type":"subscribe","events":["task.*"]}"#).unwrap();
        assert!(matches!(subscribe, ControlMessage::Subscribe { .. }));
        let filter: ControlMessage =
            serde_json::from_str(r#"{"type":"filter_task","task_id":null}"#).unwrap();
        assert!(matches!(
            filter,
            ControlMessage::FilterTask { task_id: None }
        ));
        assert!(serde_json::from_str::<ControlMessage>("not json").is_err());
    }
}
