//! Session model: the persistent record of one task's lifecycle.
//!
//! Stored as a redis hash with flat string fields; nested values (input,
//! params, result, error) are JSON strings. Timestamps are ISO-8601 UTC.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::providers::{GenerationParams, GenerationResult, TaskInput};

/// Task lifecycle state. Transitions form the DAG
/// `pending → processing → {completed, failed}`; reverse transitions are
/// forbidden and terminal states accept only deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Held by the dispatcher.
    Processing,
    /// Finished with a result (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
}

impl TaskStatus {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether no further status mutation is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the DAG permits moving to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Validation(format!("unknown task status '{other}'"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload persisted on a failed task and returned inline by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    /// Stable snake_case error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl TaskError {
    /// Snapshot a gateway error for persistence.
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Persistent record of one submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Caller-opaque unique id.
    pub task_id: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Target model; may be adopted from the conversation at dispatch time.
    pub model: Option<String>,
    /// Prompt or message list.
    pub input: TaskInput,
    /// Generation knobs.
    pub params: GenerationParams,
    /// Completion callback target.
    pub webhook_url: Option<String>,
    /// Caller-supplied idempotency token.
    pub idempotency_key: Option<String>,
    /// Attached multi-turn conversation.
    pub conversation_id: Option<String>,
    /// Whether the turn is written back to the conversation.
    pub save_to_conversation: bool,
    /// Whether the dispatcher generates chunk-by-chunk, emitting progress
    /// events (the HTTP response stays non-streaming either way).
    pub stream: bool,
    /// Queue priority; higher pops first.
    pub priority: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set when the dispatcher picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Present when completed.
    pub result: Option<GenerationResult>,
    /// Present when failed.
    pub error: Option<TaskError>,
}

impl Session {
    /// Build a fresh pending session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        model: Option<String>,
        input: TaskInput,
        params: GenerationParams,
        webhook_url: Option<String>,
        idempotency_key: Option<String>,
        conversation_id: Option<String>,
        save_to_conversation: bool,
        stream: bool,
        priority: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: TaskStatus::Pending,
            model,
            input,
            params,
            webhook_url,
            idempotency_key,
            conversation_id,
            save_to_conversation,
            stream,
            priority,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Flatten into redis hash field/value pairs.
    pub fn to_hash_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("task_id".to_string(), self.task_id.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("input".to_string(), encode_json("input", &self.input)?),
            ("params".to_string(), encode_json("params", &self.params)?),
            ("priority".to_string(), self.priority.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("updated_at".to_string(), self.updated_at.to_rfc3339()),
            (
                "save_to_conversation".to_string(),
                self.save_to_conversation.to_string(),
            ),
            ("stream".to_string(), self.stream.to_string()),
        ];
        if let Some(model) = &self.model {
            fields.push(("model".to_string(), model.clone()));
        }
        if let Some(webhook_url) = &self.webhook_url {
            fields.push(("webhook_url".to_string(), webhook_url.clone()));
        }
        if let Some(key) = &self.idempotency_key {
            fields.push(("idempotency_key".to_string(), key.clone()));
        }
        if let Some(conversation_id) = &self.conversation_id {
            fields.push(("conversation_id".to_string(), conversation_id.clone()));
        }
        if let Some(started_at) = &self.started_at {
            fields.push(("started_at".to_string(), started_at.to_rfc3339()));
        }
        if let Some(finished_at) = &self.finished_at {
            fields.push(("finished_at".to_string(), finished_at.to_rfc3339()));
        }
        if let Some(result) = &self.result {
            fields.push(("result".to_string(), encode_json("result", result)?));
        }
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), encode_json("error", error)?));
        }
        Ok(fields)
    }

    /// Decode from a redis hash map.
    pub fn from_hash(map: &HashMap<String, String>) -> Result<Self> {
        let task_id = required(map, "task_id")?.to_string();
        let status: TaskStatus = required(map, "status")?.parse()?;
        let input: TaskInput = decode_json("input", required(map, "input")?)?;
        let params: GenerationParams = decode_json("params", required(map, "params")?)?;
        Ok(Self {
            task_id,
            status,
            model: map.get("model").cloned(),
            input,
            params,
            webhook_url: map.get("webhook_url").cloned(),
            idempotency_key: map.get("idempotency_key").cloned(),
            conversation_id: map.get("conversation_id").cloned(),
            save_to_conversation: map
                .get("save_to_conversation")
                .map(|v| v == "true")
                .unwrap_or(true),
            stream: map.get("stream").map(|v| v == "true").unwrap_or(false),
            priority: map
                .get("priority")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            created_at: parse_timestamp(map, "created_at")?,
            updated_at: parse_timestamp(map, "updated_at")?,
            started_at: parse_optional_timestamp(map, "started_at"),
            finished_at: parse_optional_timestamp(map, "finished_at"),
            result: map
                .get("result")
                .map(|raw| decode_json("result", raw))
                .transpose()?,
            error: map
                .get("error")
                .map(|raw| decode_json("error", raw))
                .transpose()?,
        })
    }
}

/// One log record of a task (also mirrored into the recent ring).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Record time.
    pub timestamp: DateTime<Utc>,
    /// Task this record belongs to.
    pub task_id: String,
    /// Severity label (INFO, WARNING, ERROR).
    pub level: String,
    /// Message text.
    pub message: String,
}

fn required<'m>(map: &'m HashMap<String, String>, field: &str) -> Result<&'m str> {
    map.get(field).map(String::as_str).ok_or_else(|| {
        Error::InfrastructureUnavailable(format!("session hash missing field '{field}'"))
    })
}

fn encode_json<T: Serialize>(field: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|err| {
        Error::InfrastructureUnavailable(format!("cannot encode session field '{field}': {err}"))
    })
}

fn decode_json<T: for<'de> Deserialize<'de>>(field: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        Error::InfrastructureUnavailable(format!("cannot decode session field '{field}': {err}"))
    })
}

fn parse_timestamp(map: &HashMap<String, String>, field: &str) -> Result<DateTime<Utc>> {
    let raw = required(map, field)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            Error::InfrastructureUnavailable(format!("invalid timestamp in '{field}': {err}"))
        })
}

fn parse_optional_timestamp(map: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
    map.get(field)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session::new(
            "task-0123abcd".to_string(),
            Some("echo".to_string()),
            TaskInput::Prompt("hi".to_string()),
            GenerationParams::default(),
            Some("http://callback.local/hook".to_string()),
            Some("K1".to_string()),
            None,
            true,
            false,
            2.5,
        )
    }

    #[test]
    fn status_dag_is_enforced() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn hash_roundtrip_preserves_session() {
        let session = sample_session();
        let fields = session.to_hash_fields().unwrap();
        let map: HashMap<String, String> = fields.into_iter().collect();
        let decoded = Session::from_hash(&map).unwrap();

        assert_eq!(decoded.task_id, session.task_id);
        assert_eq!(decoded.status, TaskStatus::Pending);
        assert_eq!(decoded.model.as_deref(), Some("echo"));
        assert_eq!(decoded.input.prompt(), Some("hi"));
        assert_eq!(decoded.idempotency_key.as_deref(), Some("K1"));
        assert!((decoded.priority - 2.5).abs() < f64::EPSILON);
        assert!(decoded.save_to_conversation);
        assert_eq!(decoded.created_at, session.created_at);
    }

    #[test]
    fn absent_optional_fields_decode_as_none() {
        let session = Session::new(
            "task-1".to_string(),
            None,
            TaskInput::Prompt("p".to_string()),
            GenerationParams::default(),
            None,
            None,
            None,
            true,
            false,
            0.0,
        );
        let map: HashMap<String, String> =
            session.to_hash_fields().unwrap().into_iter().collect();
        let decoded = Session::from_hash(&map).unwrap();
        assert!(decoded.model.is_none());
        assert!(decoded.webhook_url.is_none());
        assert!(decoded.result.is_none());
        assert!(decoded.error.is_none());
    }
}
