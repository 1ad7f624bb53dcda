//! Event kind constants for type-safe routing.

// Task lifecycle
/// Task accepted and appended to the priority queue.
pub const TASK_QUEUED: &str = "task.queued";
/// Dispatcher began processing the task.
pub const TASK_STARTED: &str = "task.started";
/// Incremental progress during generation.
pub const TASK_PROGRESS: &str = "task.progress";
/// Task reached the `completed` terminal state.
pub const TASK_COMPLETED: &str = "task.completed";
/// Task reached the `failed` terminal state.
pub const TASK_FAILED: &str = "task.failed";

// Model residency
/// A local model became resident in VRAM.
pub const MODEL_LOADED: &str = "model.loaded";
/// A local model was evicted or explicitly unloaded.
pub const MODEL_UNLOADED: &str = "model.unloaded";

// Telemetry
/// Periodic GPU/VRAM snapshot.
pub const GPU_STATS: &str = "gpu_stats";
/// A log record was appended to the recent-logs ring.
pub const LOG: &str = "log";

// Control frames (WebSocket replies)
/// Greeting after connection accept.
pub const CONNECTED: &str = "connected";
/// Subscription list updated.
pub const SUBSCRIBED: &str = "subscribed";
/// Subscription list reduced.
pub const UNSUBSCRIBED: &str = "unsubscribed";
/// Task filter updated.
pub const FILTER_SET: &str = "filter_set";
/// Reply to `ping`.
pub const PONG: &str = "pong";
/// Reply to `get_queue_stats`.
pub const QUEUE_STATS: &str = "queue_stats";
/// Reply to `get_stats`.
pub const STATS: &str = "stats";
/// Reply to `get_task`.
pub const TASK: &str = "task";
/// Reply to `get_errors`.
pub const ERRORS: &str = "errors";
/// Reply to `get_active_tasks`.
pub const ACTIVE_TASKS: &str = "active_tasks";
/// Error control frame; the socket stays open.
pub const ERROR: &str = "error";
/// Idle keep-alive frame.
pub const HEARTBEAT: &str = "heartbeat";
/// Initial state snapshot after connect.
pub const INITIAL: &str = "initial";

/// Broadcast event kinds a subscriber can ask for (excludes control frames).
pub const SUBSCRIBABLE: &[&str] = &[
    GPU_STATS,
    TASK_QUEUED,
    TASK_STARTED,
    TASK_PROGRESS,
    TASK_COMPLETED,
    TASK_FAILED,
    MODEL_LOADED,
    MODEL_UNLOADED,
    LOG,
];
