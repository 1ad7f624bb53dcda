//! Event bus for the modelrelay gateway.
//!
//! Provides a pub/sub event system backed by tokio's broadcast channel.
//! Used to decouple the dispatcher, the GPU telemetry ticker, and the
//! WebSocket monitor subscribers.
//!
//! # Architecture
//!
//! ```text
//! GatewayEvent (kind, task_id, payload)
//!      ↓
//! EventBus.publish() → broadcast::Sender
//!      ↓
//! Fan-out to multiple subscribers
//!      ↓
//! Each subscriber filters by kind pattern and optional task id
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;

pub mod kinds;

/// Core event model: one lifecycle or telemetry event on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event kind, e.g. `task.queued`, `gpu_stats` (see [`kinds`]).
    #[serde(rename = "type")]
    pub kind: String,
    /// Issuance timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Task this event belongs to, when it is task-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Flexible JSON payload.
    pub data: Value,
}

impl GatewayEvent {
    /// Create a new event.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            task_id: None,
            data,
        }
    }

    /// Create a task-scoped event; `task_id` is duplicated into the payload
    /// so subscribers see it without inspecting the envelope.
    pub fn for_task(kind: impl Into<String>, task_id: impl Into<String>, mut data: Value) -> Self {
        let task_id = task_id.into();
        if let Value::Object(ref mut map) = data {
            map.entry("task_id")
                .or_insert_with(|| Value::String(task_id.clone()));
        }
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            task_id: Some(task_id),
            data,
        }
    }

    /// Create a simple message-payload event.
    pub fn with_message(kind: &str, message: &str) -> Self {
        Self::new(kind, json!({ "message": message }))
    }
}

impl std::fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.kind,
            self.data
        )
    }
}

/// Async event bus over `tokio::sync::broadcast`.
///
/// - Thread-safe 1-to-many fan-out
/// - Non-blocking publish (a slow subscriber never stalls the publisher)
/// - A lagged subscriber loses the overwritten events, not the bus
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<GatewayEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the given per-subscriber queue capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Per-subscriber queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event; 0 when
    /// nobody is listening (not an error).
    pub fn publish(&self, event: GatewayEvent) -> usize {
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    /// Publish a task-scoped event (convenience).
    pub fn emit_task(&self, kind: &str, task_id: &str, data: Value) -> usize {
        self.publish(GatewayEvent::for_task(kind, task_id, data))
    }

    /// Subscribe to the bus. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayEvent>> {
        self.tx.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Whether `kind` matches a subscription pattern set.
///
/// `*` matches everything; `task.*` matches every kind with the `task.`
/// prefix; anything else must match exactly.
pub fn kind_matches(patterns: &HashSet<String>, kind: &str) -> bool {
    if patterns.contains("*") || patterns.contains(kind) {
        return true;
    }
    match kind.split_once('.') {
        Some((prefix, _)) => patterns.contains(&format!("{prefix}.*")),
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_creation() {
        let event = GatewayEvent::new(kinds::GPU_STATS, json!({"used_mb": 42}));
        assert_eq!(event.kind, kinds::GPU_STATS);
        assert!(event.task_id.is_none());
        assert!(event.timestamp <= Utc::now());
    }

    #[test]
    fn task_event_duplicates_id_into_payload() {
        let event = GatewayEvent::for_task(kinds::TASK_QUEUED, "task-1", json!({}));
        assert_eq!(event.task_id.as_deref(), Some("task-1"));
        assert_eq!(event.data["task_id"], "task-1");
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let event = GatewayEvent::new(kinds::HEARTBEAT, json!({}));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], kinds::HEARTBEAT);
        assert!(wire.get("timestamp").is_some());
    }

    #[test]
    fn kind_matching_honors_wildcards() {
        let wildcard: HashSet<String> = ["*".to_string()].into();
        assert!(kind_matches(&wildcard, kinds::TASK_FAILED));

        let prefix: HashSet<String> = ["task.*".to_string()].into();
        assert!(kind_matches(&prefix, kinds::TASK_COMPLETED));
        assert!(!kind_matches(&prefix, kinds::GPU_STATS));

        let exact: HashSet<String> = [kinds::GPU_STATS.to_string()].into();
        assert!(kind_matches(&exact, kinds::GPU_STATS));
        assert!(!kind_matches(&exact, kinds::TASK_QUEUED));
    }

    #[tokio::test]
    async fn bus_publishes_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit_task(kinds::TASK_QUEUED, "task-9", json!({"priority": 0.0}));

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert_eq!(received1.kind, kinds::TASK_QUEUED);
        assert_eq!(received1.data, received2.data);
    }

    #[tokio::test]
    async fn subscriber_count_tracks_receivers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
