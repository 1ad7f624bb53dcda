//! Dispatcher: owns the task lifecycle.
//!
//! One logical worker per process drains the priority queue and enforces
//! one-at-a-time GPU use. Status writes go through here and nowhere else;
//! transitions follow the DAG `pending → processing → {completed, failed}`.
//! Shutdown is cooperative: the loop observes cancellation between tasks
//! and never interrupts an in-flight generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use modelrelay_events::{EventBus, kinds};
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gpu::GpuGuard;
use crate::observability::LogEvent;
use crate::providers::{
    ChatMessage, GenerationParams, GenerationResult, ModelResidency, ProviderRegistry, Role,
    TaskInput,
};
use crate::store::{ConversationStore, Session, TaskError, TaskStatus, TaskStore};

pub mod webhook;

pub use webhook::WebhookDelivery;

/// Idle sleep between queue polls when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Backoff after an unexpected worker-loop error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One task submission, already adapted from the wire shape.
#[derive(Debug, Clone)]
pub struct SubmitTask {
    /// Target model; may be omitted when a conversation supplies one.
    pub model: Option<String>,
    /// Prompt or messages.
    pub input: TaskInput,
    /// Generation knobs.
    pub params: GenerationParams,
    /// Completion callback.
    pub webhook_url: Option<String>,
    /// At-most-one-task token.
    pub idempotency_key: Option<String>,
    /// Queue priority; higher pops first.
    pub priority: f64,
    /// Attached conversation.
    pub conversation_id: Option<String>,
    /// Whether the turn is written back to the conversation.
    pub save_to_conversation: bool,
    /// Generate chunk-by-chunk and emit `task.progress` events.
    pub stream: bool,
}

/// The task lifecycle owner.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    conversations: Arc<ConversationStore>,
    registry: Arc<ProviderRegistry>,
    residency: Arc<ModelResidency>,
    guard: Arc<GpuGuard>,
    webhooks: Arc<WebhookDelivery>,
    bus: EventBus,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Wire up a dispatcher; call [`Dispatcher::start`] to begin draining.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        conversations: Arc<ConversationStore>,
        registry: Arc<ProviderRegistry>,
        residency: Arc<ModelResidency>,
        guard: Arc<GpuGuard>,
        webhooks: Arc<WebhookDelivery>,
        bus: EventBus,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            conversations,
            registry,
            residency,
            guard,
            webhooks,
            bus,
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Task ids sort lexicographically in creation order (millisecond
    /// granularity), which gives the queue its FIFO tiebreak for equal
    /// priorities.
    fn new_task_id() -> String {
        let epoch_ms = Utc::now().timestamp_millis().max(0) as u64;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("task-{epoch_ms:012x}{}", &suffix[..8])
    }

    /// Accept a task: idempotency echo, model resolvability check, session
    /// creation, enqueue, `task.queued` event. Returns the task id.
    pub async fn submit_task(&self, submit: SubmitTask) -> Result<String> {
        submit.params.validate()?;
        if let TaskInput::Prompt(prompt) = &submit.input {
            if prompt.trim().is_empty() {
                return Err(Error::Validation("prompt must be non-empty".to_string()));
            }
        }
        if let TaskInput::Messages(messages) = &submit.input {
            if messages.is_empty() {
                return Err(Error::Validation("messages must be non-empty".to_string()));
            }
        }

        if let Some(key) = &submit.idempotency_key {
            if let Some(existing) = self.store.task_by_idempotency(key).await? {
                tracing::info!(
                    event = LogEvent::TaskIdempotentHit.as_str(),
                    idempotency_key = %key,
                    task_id = %existing,
                    "idempotent submission; returning original task"
                );
                return Ok(existing);
            }
        }

        match &submit.model {
            Some(model) => {
                if !self.registry.is_resolvable(model).await {
                    return Err(Error::ModelNotFound {
                        model: model.clone(),
                    });
                }
            }
            None => {
                if submit.conversation_id.is_none() {
                    return Err(Error::Validation(
                        "model is required when no conversation is attached".to_string(),
                    ));
                }
            }
        }

        let task_id = Self::new_task_id();
        let session = Session::new(
            task_id.clone(),
            submit.model.clone(),
            submit.input,
            submit.params,
            submit.webhook_url,
            submit.idempotency_key,
            submit.conversation_id,
            submit.save_to_conversation,
            submit.stream,
            submit.priority,
        );
        self.store.create_session(&session).await?;
        if let Err(err) = self.store.enqueue_task(&task_id, submit.priority).await {
            // Backpressure: drop the session we just wrote so a rejected
            // submission leaves no pending orphan behind.
            let _ = self.store.delete_session(&task_id).await;
            return Err(err);
        }
        self.log_task(&task_id, "INFO", "task created and queued")
            .await;
        self.bus.emit_task(
            kinds::TASK_QUEUED,
            &task_id,
            json!({ "model": session.model, "priority": submit.priority }),
        );
        tracing::info!(
            event = LogEvent::TaskSubmitted.as_str(),
            task_id = %task_id,
            model = ?session.model,
            priority = submit.priority,
            has_webhook = session.webhook_url.is_some(),
            has_idempotency = session.idempotency_key.is_some(),
            "task submitted"
        );
        Ok(task_id)
    }

    /// Launch the worker loop. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::warn!("dispatcher already running");
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let dispatcher = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            dispatcher.worker_loop().await;
        }));
        tracing::info!(event = LogEvent::WorkerStarted.as_str(), "dispatcher started");
    }

    /// Cooperative stop: the loop exits between tasks; an in-flight
    /// generation runs to completion first.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "dispatcher worker crashed");
            }
        }
        tracing::info!(event = LogEvent::WorkerStopped.as_str(), "dispatcher stopped");
    }

    async fn worker_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.recover_interrupted().await;
        tracing::info!("worker loop started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.store.dequeue_task().await {
                Ok(Some(task_id)) => {
                    self.process_task(&task_id).await;
                    // Cleanup phase: the marker is cleared on every path.
                    if let Err(err) = self.store.clear_processing().await {
                        tracing::error!(task_id = %task_id, error = %err, "cannot clear processing marker");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "worker loop store error");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
        tracing::info!("worker loop finished");
    }

    /// Startup recovery: a `processing` session left behind by a crashed
    /// dispatcher is marked failed instead of dangling forever.
    async fn recover_interrupted(&self) {
        let orphan = match self.store.get_processing().await {
            Ok(Some(task_id)) => task_id,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "cannot inspect processing marker at startup");
                return;
            }
        };
        if let Ok(Some(session)) = self.store.get_session(&orphan).await {
            if session.status == TaskStatus::Processing {
                let error = TaskError {
                    code: "interrupted".to_string(),
                    message: "dispatcher restarted while the task was processing".to_string(),
                };
                let _ = self
                    .store
                    .update_session_status(&orphan, TaskStatus::Failed, None, Some(&error))
                    .await;
                self.bus.emit_task(
                    kinds::TASK_FAILED,
                    &orphan,
                    json!({ "error_code": error.code, "message": error.message }),
                );
                tracing::warn!(
                    event = LogEvent::TaskInterruptedRecovered.as_str(),
                    task_id = %orphan,
                    "recovered interrupted task as failed"
                );
            }
        }
        let _ = self.store.clear_processing().await;
    }

    async fn process_task(&self, task_id: &str) {
        tracing::info!(task_id, "processing task");
        let session = match self.store.get_session(task_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(
                    event = LogEvent::TaskOrphaned.as_str(),
                    task_id,
                    "queued task has no session; dropping"
                );
                return;
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "cannot load session");
                return;
            }
        };
        if !session.status.can_transition_to(TaskStatus::Processing) {
            tracing::warn!(
                task_id,
                status = session.status.as_str(),
                "queued task is not pending; dropping"
            );
            return;
        }

        if let Err(err) = self.store.set_processing(task_id).await {
            tracing::error!(task_id, error = %err, "cannot set processing marker");
            return;
        }
        if let Err(err) = self
            .store
            .update_session_status(task_id, TaskStatus::Processing, None, None)
            .await
        {
            tracing::error!(task_id, error = %err, "cannot mark task processing");
            return;
        }
        tracing::info!(
            event = LogEvent::TaskProcessingStarted.as_str(),
            task_id,
            "task processing started"
        );

        let started = Instant::now();
        match self.execute(task_id, &session).await {
            Ok(result) => self.complete_task(task_id, &session, result, started).await,
            Err(err) => self.fail_task(task_id, &session, &err, started).await,
        }
    }

    /// Build context, resolve the provider, hold the GPU, generate.
    ///
    /// `task.started` is emitted only once the GPU guard is held: a task
    /// rejected at VRAM admission (or with an unresolvable model) goes
    /// straight to `task.failed` without ever having started.
    async fn execute(&self, task_id: &str, session: &Session) -> Result<GenerationResult> {
        let mut model = session.model.clone();
        let mut history: Vec<ChatMessage> = Vec::new();
        if let Some(conversation_id) = &session.conversation_id {
            match self.conversations.get_conversation(conversation_id).await? {
                Some(conversation) => {
                    if model.is_none() {
                        model = conversation.model.clone();
                    }
                    history = self
                        .conversations
                        .get_context_messages(conversation_id)
                        .await?;
                }
                None => {
                    tracing::warn!(
                        task_id,
                        conversation_id = %conversation_id,
                        "attached conversation no longer exists; continuing without context"
                    );
                }
            }
        }
        let model = model.ok_or_else(|| {
            Error::Validation("task has no model and its conversation supplies none".to_string())
        })?;

        let input = if history.is_empty() {
            session.input.clone()
        } else {
            let mut messages = history;
            messages.extend(session.input.as_messages());
            TaskInput::Messages(messages)
        };

        let provider = self.registry.get_or_create(&model).await?;
        // An explicit per-task requirement wins over the model's own.
        let required_vram_mb = session
            .params
            .extra
            .get("required_vram_mb")
            .and_then(serde_json::Value::as_u64)
            .or_else(|| provider.local_control().map(|c| c.required_vram_mb()));

        let _permit = self.guard.acquire(task_id, required_vram_mb).await?;
        self.log_task(task_id, "INFO", "task started").await;
        self.bus
            .emit_task(kinds::TASK_STARTED, task_id, json!({ "model": model }));
        self.residency.ensure_resident(&model, &provider).await?;
        if session.stream {
            self.generate_streaming(task_id, provider.as_ref(), &input, &session.params, &model)
                .await
        } else {
            provider.generate(&input, &session.params).await
        }
        // _permit drops here: the guard is released on success and on error.
    }

    /// Chunked generation: forward each chunk as a `task.progress` event,
    /// assemble the final result from the accumulated text and the last
    /// chunk's finish reason and usage.
    async fn generate_streaming(
        &self,
        task_id: &str,
        provider: &dyn crate::providers::Provider,
        input: &TaskInput,
        params: &GenerationParams,
        model: &str,
    ) -> Result<GenerationResult> {
        use futures::StreamExt;

        let mut stream = provider.generate_stream(input, params).await?;
        let mut text = String::new();
        let mut finish_reason = crate::providers::FinishReason::Stop;
        let mut usage: Option<crate::providers::Usage> = None;
        let mut sequence = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.text.is_empty() {
                text.push_str(&chunk.text);
                self.bus.emit_task(
                    kinds::TASK_PROGRESS,
                    task_id,
                    json!({ "text": chunk.text, "sequence": sequence }),
                );
                sequence += 1;
            }
            if let Some(reason) = chunk.finish_reason {
                finish_reason = reason;
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }
        let usage = usage.unwrap_or_else(|| {
            let completion_tokens = (text.split_whitespace().count() as u64).max(1);
            crate::providers::Usage {
                prompt_tokens: 0,
                completion_tokens,
                total_tokens: completion_tokens,
            }
        });
        Ok(GenerationResult {
            text,
            finish_reason,
            usage,
            model: model.to_string(),
            extra: Default::default(),
        })
    }

    /// Append to the task's log list and mirror onto the bus as a `log`
    /// event.
    async fn log_task(&self, task_id: &str, level: &str, message: &str) {
        if let Err(err) = self.store.append_log(task_id, level, message).await {
            tracing::debug!(task_id, error = %err, "cannot append task log");
        }
        self.bus.emit_task(
            kinds::LOG,
            task_id,
            json!({ "level": level, "message": message }),
        );
    }

    async fn complete_task(
        &self,
        task_id: &str,
        session: &Session,
        result: GenerationResult,
        started: Instant,
    ) {
        if let Err(err) = self
            .store
            .update_session_status(task_id, TaskStatus::Completed, Some(&result), None)
            .await
        {
            tracing::error!(task_id, error = %err, "cannot persist completed result");
        }
        self.log_task(task_id, "INFO", "task completed").await;
        self.bus.emit_task(
            kinds::TASK_COMPLETED,
            task_id,
            json!({ "tokens_used": result.usage.total_tokens, "finish_reason": result.finish_reason }),
        );
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(err) = self
            .store
            .record_task_completion(result.usage.total_tokens, duration_ms, true)
            .await
        {
            tracing::debug!(task_id, error = %err, "cannot record completion stats");
        }
        tracing::info!(
            event = LogEvent::TaskCompleted.as_str(),
            task_id,
            tokens = result.usage.total_tokens,
            duration_ms,
            "task completed"
        );

        self.write_back_conversation(task_id, session, &result.text)
            .await;

        if let Some(webhook_url) = &session.webhook_url {
            let data = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            self.spawn_webhook(task_id, webhook_url, "completed", data);
        }
    }

    async fn fail_task(&self, task_id: &str, session: &Session, err: &Error, started: Instant) {
        let error = TaskError::from_error(err);
        if let Err(store_err) = self
            .store
            .update_session_status(task_id, TaskStatus::Failed, None, Some(&error))
            .await
        {
            tracing::error!(task_id, error = %store_err, "cannot persist task failure");
        }
        self.log_task(task_id, "ERROR", &format!("task failed: {err}"))
            .await;
        self.bus.emit_task(
            kinds::TASK_FAILED,
            task_id,
            json!({ "error_code": error.code, "message": error.message }),
        );
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(stats_err) = self.store.record_task_completion(0, duration_ms, false).await {
            tracing::debug!(task_id, error = %stats_err, "cannot record failure stats");
        }
        tracing::warn!(
            event = LogEvent::TaskFailed.as_str(),
            task_id,
            error_code = %error.code,
            error = %error.message,
            "task failed"
        );

        if let Some(webhook_url) = &session.webhook_url {
            self.spawn_webhook(
                task_id,
                webhook_url,
                "failed",
                json!({ "error": { "code": error.code, "message": error.message } }),
            );
        }
    }

    /// Persist the turn into the attached conversation:
    /// `[…history, user_turn, assistant_reply]`. Only on success, and only
    /// when the submission did not opt out.
    async fn write_back_conversation(&self, task_id: &str, session: &Session, reply: &str) {
        let Some(conversation_id) = &session.conversation_id else {
            return;
        };
        if !session.save_to_conversation {
            return;
        }
        let user_turn = match &session.input {
            TaskInput::Prompt(prompt) => Some(prompt.clone()),
            TaskInput::Messages(messages) => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone()),
        };
        if let Some(content) = user_turn {
            if let Err(err) = self
                .conversations
                .add_message(conversation_id, Role::User, &content)
                .await
            {
                tracing::warn!(task_id, conversation_id = %conversation_id, error = %err, "cannot save user turn");
            }
        }
        if let Err(err) = self
            .conversations
            .add_message(conversation_id, Role::Assistant, reply)
            .await
        {
            tracing::warn!(task_id, conversation_id = %conversation_id, error = %err, "cannot save assistant reply");
        }
    }

    fn spawn_webhook(&self, task_id: &str, webhook_url: &str, status: &str, data: serde_json::Value) {
        let webhooks = Arc::clone(&self.webhooks);
        let task_id = task_id.to_string();
        let webhook_url = webhook_url.to_string();
        let status = status.to_string();
        tokio::spawn(async move {
            webhooks.deliver(&task_id, &webhook_url, &status, data).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;

    #[test]
    fn task_ids_sort_in_creation_order() {
        let first = Dispatcher::new_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Dispatcher::new_task_id();
        assert!(first < second, "{first} should sort before {second}");
        assert!(first.starts_with("task-"));
        assert_eq!(first.len(), "task-".len() + 12 + 8);
    }
}
