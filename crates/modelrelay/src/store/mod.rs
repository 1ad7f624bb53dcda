//! Task store: sessions, priority queue, idempotency index, log rings,
//! GPU-stats cache and daily counters: the sole coordination surface
//! between HTTP handlers and the dispatcher.
//!
//! Key layout (TTLs in parentheses):
//!
//! ```text
//! session:{task_id}              hash (24h sliding)
//! queue:tasks                    sorted set (score = -priority)
//! queue:processing               string (current task_id)
//! idempotency:{key}              string -> task_id (24h)
//! logs:{task_id}                 list
//! logs:recent                    list (capped)
//! system:gpu                     string (5s)
//! stats:daily:YYYY-MM-DD         hash (7d)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::observability::LogEvent;

pub mod conversation;
pub mod redis;
pub mod session;

pub use conversation::{Conversation, ConversationStore};
pub use self::redis::RedisHandle;
pub use session::{LogEntry, Session, TaskError, TaskStatus};

use crate::providers::GenerationResult;

const SESSION_PREFIX: &str = "session:";
const QUEUE_KEY: &str = "queue:tasks";
const PROCESSING_KEY: &str = "queue:processing";
const IDEMPOTENCY_PREFIX: &str = "idempotency:";
const LOGS_PREFIX: &str = "logs:";
const LOGS_RECENT_KEY: &str = "logs:recent";
const GPU_CACHE_KEY: &str = "system:gpu";
const STATS_PREFIX: &str = "stats:daily:";

const GPU_CACHE_TTL_SECS: u64 = 5;
const STATS_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Store tunables, derived from [`crate::config::Settings`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Session hash TTL, sliding on writes.
    pub session_ttl_secs: u64,
    /// Idempotency mapping TTL.
    pub idempotency_ttl_secs: u64,
    /// Cap of the cross-task recent-logs ring.
    pub logs_max_recent: u64,
    /// Enqueue backpressure threshold.
    pub queue_max_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 3600,
            idempotency_ttl_secs: 24 * 3600,
            logs_max_recent: 1000,
            queue_max_size: 1000,
        }
    }
}

/// Aggregate queue counters for the monitor surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Entries waiting in the priority queue.
    pub queue_size: u64,
    /// Task currently held by the dispatcher, if any.
    pub processing_task: Option<String>,
    /// Records in the recent-logs ring.
    pub recent_logs_count: u64,
}

/// Redis-backed session storage for task lifecycle management.
pub struct TaskStore {
    handle: Arc<RedisHandle>,
    config: StoreConfig,
}

impl TaskStore {
    /// Build a store over a shared connection handle.
    pub fn new(handle: Arc<RedisHandle>, config: StoreConfig) -> Self {
        Self { handle, config }
    }

    fn session_key(task_id: &str) -> String {
        format!("{SESSION_PREFIX}{task_id}")
    }

    fn logs_key(task_id: &str) -> String {
        format!("{LOGS_PREFIX}{task_id}")
    }

    fn idempotency_key(key: &str) -> String {
        format!("{IDEMPOTENCY_PREFIX}{key}")
    }

    /// Persist a fresh pending session; writes the idempotency mapping in
    /// the same atomic pipeline when a key is present.
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        let session_key = Self::session_key(&session.task_id);
        let fields = session.to_hash_fields()?;
        let idempotency = session
            .idempotency_key
            .as_ref()
            .map(|key| (Self::idempotency_key(key), session.task_id.clone()));
        let session_ttl = self.config.session_ttl_secs;
        let idempotency_ttl = self.config.idempotency_ttl_secs;

        self.handle
            .run_pipeline::<(), _>("create_session", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                let cmd = pipe.cmd("HSET");
                cmd.arg(&session_key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
                pipe.cmd("EXPIRE").arg(&session_key).arg(session_ttl).ignore();
                if let Some((key, task_id)) = &idempotency {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(task_id)
                        .arg("EX")
                        .arg(idempotency_ttl)
                        .ignore();
                }
                pipe
            })
            .await?;

        tracing::info!(
            event = LogEvent::SessionCreated.as_str(),
            task_id = %session.task_id,
            model = ?session.model,
            has_webhook = session.webhook_url.is_some(),
            has_idempotency = session.idempotency_key.is_some(),
            "session created"
        );
        Ok(())
    }

    /// Load and decode a session; `None` when absent or expired.
    pub async fn get_session(&self, task_id: &str) -> Result<Option<Session>> {
        let key = Self::session_key(task_id);
        let map: HashMap<String, String> = self
            .handle
            .run_command("get_session", || {
                let mut cmd = ::redis::cmd("HGETALL");
                cmd.arg(&key);
                cmd
            })
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Session::from_hash(&map).map(Some)
    }

    /// Write a status transition. Does not validate the DAG; the
    /// dispatcher is the sole writer and owns that invariant. Terminal
    /// states also write `finished_at` plus result or error; `processing`
    /// writes `started_at`. Every write refreshes the TTL.
    pub async fn update_session_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&GenerationResult>,
        error: Option<&TaskError>,
    ) -> Result<()> {
        let key = Self::session_key(task_id);
        let now = Utc::now().to_rfc3339();
        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            ("updated_at".to_string(), now.clone()),
        ];
        if status == TaskStatus::Processing {
            fields.push(("started_at".to_string(), now.clone()));
        }
        if status.is_terminal() {
            fields.push(("finished_at".to_string(), now));
        }
        if let Some(result) = result {
            let encoded = serde_json::to_string(result).map_err(|err| {
                Error::InfrastructureUnavailable(format!("cannot encode result: {err}"))
            })?;
            fields.push(("result".to_string(), encoded));
        }
        if let Some(error) = error {
            let encoded = serde_json::to_string(error).map_err(|err| {
                Error::InfrastructureUnavailable(format!("cannot encode error: {err}"))
            })?;
            fields.push(("error".to_string(), encoded));
        }
        let ttl = self.config.session_ttl_secs;

        self.handle
            .run_pipeline::<(), _>("update_session_status", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                let cmd = pipe.cmd("HSET");
                cmd.arg(&key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
                pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                pipe
            })
            .await?;

        tracing::debug!(
            event = LogEvent::SessionUpdated.as_str(),
            task_id,
            status = status.as_str(),
            "session status updated"
        );
        Ok(())
    }

    /// Task id mapped to an idempotency key, when the mapping is live.
    pub async fn task_by_idempotency(&self, key: &str) -> Result<Option<String>> {
        let redis_key = Self::idempotency_key(key);
        self.handle
            .run_command("task_by_idempotency", || {
                let mut cmd = ::redis::cmd("GET");
                cmd.arg(&redis_key);
                cmd
            })
            .await
    }

    /// Delete a session and its per-task logs.
    pub async fn delete_session(&self, task_id: &str) -> Result<()> {
        let session_key = Self::session_key(task_id);
        let logs_key = Self::logs_key(task_id);
        let _: i64 = self
            .handle
            .run_command("delete_session", || {
                let mut cmd = ::redis::cmd("DEL");
                cmd.arg(&session_key).arg(&logs_key);
                cmd
            })
            .await?;
        tracing::debug!(
            event = LogEvent::SessionDeleted.as_str(),
            task_id,
            "session deleted"
        );
        Ok(())
    }

    /// Append a task to the priority queue (score = −priority). Fails with
    /// `queue-full` at the configured capacity; the size check and the
    /// insert run in one script so concurrent submitters cannot overshoot.
    pub async fn enqueue_task(&self, task_id: &str, priority: f64) -> Result<()> {
        const SCRIPT: &str = r#"
local queue = KEYS[1]
local max_size = tonumber(ARGV[1])
local score = tonumber(ARGV[2])
local member = ARGV[3]
local size = redis.call("ZCARD", queue)
if size >= max_size then
  return {0, size}
end
redis.call("ZADD", queue, score, member)
return {1, size + 1}
"#;
        let max = self.config.queue_max_size;
        let score = -priority;
        let task = task_id.to_string();
        let (accepted, size): (i64, i64) = self
            .handle
            .run_command("enqueue_task", || {
                let mut cmd = ::redis::cmd("EVAL");
                cmd.arg(SCRIPT)
                    .arg(1)
                    .arg(QUEUE_KEY)
                    .arg(max)
                    .arg(score)
                    .arg(&task);
                cmd
            })
            .await?;
        if accepted == 0 {
            return Err(Error::QueueFull {
                size: size.max(0) as u64,
                max,
            });
        }
        tracing::debug!(
            event = LogEvent::TaskEnqueued.as_str(),
            task_id,
            priority,
            queue_size = size,
            "task enqueued"
        );
        Ok(())
    }

    /// Atomically pop the highest-priority task; `None` when empty.
    pub async fn dequeue_task(&self) -> Result<Option<String>> {
        let popped: Vec<(String, f64)> = self
            .handle
            .run_command("dequeue_task", || {
                let mut cmd = ::redis::cmd("ZPOPMIN");
                cmd.arg(QUEUE_KEY).arg(1);
                cmd
            })
            .await?;
        let task_id = popped.into_iter().next().map(|(member, _)| member);
        if let Some(ref task_id) = task_id {
            tracing::debug!(
                event = LogEvent::TaskDequeued.as_str(),
                task_id,
                "task dequeued"
            );
        }
        Ok(task_id)
    }

    /// Entries waiting in the queue.
    pub async fn queue_size(&self) -> Result<u64> {
        self.handle
            .run_command("queue_size", || {
                let mut cmd = ::redis::cmd("ZCARD");
                cmd.arg(QUEUE_KEY);
                cmd
            })
            .await
    }

    /// Record the task the dispatcher currently holds.
    pub async fn set_processing(&self, task_id: &str) -> Result<()> {
        let task = task_id.to_string();
        let _: () = self
            .handle
            .run_command("set_processing", || {
                let mut cmd = ::redis::cmd("SET");
                cmd.arg(PROCESSING_KEY).arg(&task);
                cmd
            })
            .await?;
        Ok(())
    }

    /// Task the dispatcher currently holds, if any.
    pub async fn get_processing(&self) -> Result<Option<String>> {
        self.handle
            .run_command("get_processing", || {
                let mut cmd = ::redis::cmd("GET");
                cmd.arg(PROCESSING_KEY);
                cmd
            })
            .await
    }

    /// Clear the processing marker.
    pub async fn clear_processing(&self) -> Result<()> {
        let _: i64 = self
            .handle
            .run_command("clear_processing", || {
                let mut cmd = ::redis::cmd("DEL");
                cmd.arg(PROCESSING_KEY);
                cmd
            })
            .await?;
        Ok(())
    }

    /// Append a log record to the per-task list and the capped recent ring.
    pub async fn append_log(&self, task_id: &str, level: &str, message: &str) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
        };
        let encoded = serde_json::to_string(&entry).map_err(|err| {
            Error::InfrastructureUnavailable(format!("cannot encode log entry: {err}"))
        })?;
        let task_key = Self::logs_key(task_id);
        let cap = self.config.logs_max_recent as i64;

        self.handle
            .run_pipeline::<(), _>("append_log", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.cmd("RPUSH").arg(&task_key).arg(&encoded).ignore();
                pipe.cmd("RPUSH").arg(LOGS_RECENT_KEY).arg(&encoded).ignore();
                pipe.cmd("LTRIM")
                    .arg(LOGS_RECENT_KEY)
                    .arg(-cap)
                    .arg(-1)
                    .ignore();
                pipe
            })
            .await
    }

    /// All log records of one task, in order.
    pub async fn get_logs(&self, task_id: &str) -> Result<Vec<LogEntry>> {
        let key = Self::logs_key(task_id);
        let payloads: Vec<String> = self
            .handle
            .run_command("get_logs", || {
                let mut cmd = ::redis::cmd("LRANGE");
                cmd.arg(&key).arg(0).arg(-1);
                cmd
            })
            .await?;
        Ok(decode_log_entries(payloads))
    }

    /// Most recent log records across all tasks.
    pub async fn get_recent_logs(&self, limit: u64) -> Result<Vec<LogEntry>> {
        let limit = limit.max(1) as i64;
        let payloads: Vec<String> = self
            .handle
            .run_command("get_recent_logs", || {
                let mut cmd = ::redis::cmd("LRANGE");
                cmd.arg(LOGS_RECENT_KEY).arg(-limit).arg(-1);
                cmd
            })
            .await?;
        Ok(decode_log_entries(payloads))
    }

    /// Cache a GPU telemetry snapshot (short TTL).
    pub async fn cache_gpu_stats(&self, stats: &Value) -> Result<()> {
        let encoded = stats.to_string();
        let _: () = self
            .handle
            .run_command("cache_gpu_stats", || {
                let mut cmd = ::redis::cmd("SET");
                cmd.arg(GPU_CACHE_KEY)
                    .arg(&encoded)
                    .arg("EX")
                    .arg(GPU_CACHE_TTL_SECS);
                cmd
            })
            .await?;
        Ok(())
    }

    /// Cached GPU snapshot, when still fresh.
    pub async fn get_cached_gpu_stats(&self) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .handle
            .run_command("get_cached_gpu_stats", || {
                let mut cmd = ::redis::cmd("GET");
                cmd.arg(GPU_CACHE_KEY);
                cmd
            })
            .await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Bump one daily counter (7-day TTL on the day's hash).
    pub async fn increment_daily_stat(&self, name: &str, delta: i64) -> Result<()> {
        let key = format!("{STATS_PREFIX}{}", Utc::now().format("%Y-%m-%d"));
        let field = name.to_string();
        self.handle
            .run_pipeline::<(), _>("increment_daily_stat", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.cmd("HINCRBY").arg(&key).arg(&field).arg(delta).ignore();
                pipe.cmd("EXPIRE").arg(&key).arg(STATS_TTL_SECS).ignore();
                pipe
            })
            .await
    }

    /// Daily counters for a date (`YYYY-MM-DD`; today when absent).
    pub async fn get_daily_stats(&self, date: Option<&str>) -> Result<BTreeMap<String, i64>> {
        let key = match date {
            Some(date) => format!("{STATS_PREFIX}{date}"),
            None => format!("{STATS_PREFIX}{}", Utc::now().format("%Y-%m-%d")),
        };
        let map: HashMap<String, String> = self
            .handle
            .run_command("get_daily_stats", || {
                let mut cmd = ::redis::cmd("HGETALL");
                cmd.arg(&key);
                cmd
            })
            .await?;
        Ok(map
            .into_iter()
            .filter_map(|(name, value)| value.parse().ok().map(|v| (name, v)))
            .collect())
    }

    /// Aggregate one terminal task into the daily counters.
    pub async fn record_task_completion(
        &self,
        tokens_used: u64,
        duration_ms: u64,
        success: bool,
    ) -> Result<()> {
        let outcome = if success { "tasks_completed" } else { "tasks_failed" };
        self.increment_daily_stat(outcome, 1).await?;
        self.increment_daily_stat("tokens_used", tokens_used as i64)
            .await?;
        self.increment_daily_stat("total_duration_ms", duration_ms as i64)
            .await
    }

    /// Aggregate queue counters.
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let queue_size = self.queue_size().await?;
        let processing_task = self.get_processing().await?;
        let recent_logs_count: u64 = self
            .handle
            .run_command("recent_logs_count", || {
                let mut cmd = ::redis::cmd("LLEN");
                cmd.arg(LOGS_RECENT_KEY);
                cmd
            })
            .await?;
        Ok(StoreStats {
            queue_size,
            processing_task,
            recent_logs_count,
        })
    }

    /// Round-trip probe to the key-value service.
    pub async fn health_check(&self) -> bool {
        self.handle.ping().await.is_ok()
    }
}

fn decode_log_entries(payloads: Vec<String>) -> Vec<LogEntry> {
    payloads
        .into_iter()
        .filter_map(|payload| match serde_json::from_str(&payload) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(error = %err, "invalid log entry payload in store");
                None
            }
        })
        .collect()
}
