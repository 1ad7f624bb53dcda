//! Stable identifiers for structured log events.
//!
//! Every `tracing` call that downstream dashboards key on carries an
//! `event = <id>` field from this registry, so renaming a log message never
//! breaks a query.

/// Machine-readable identifiers attached to structured log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum LogEvent {
    StoreConnected,
    StoreCommandRetrySucceeded,
    StoreCommandRetryFailed,
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    TaskEnqueued,
    TaskDequeued,
    TaskSubmitted,
    TaskIdempotentHit,
    TaskProcessingStarted,
    TaskCompleted,
    TaskFailed,
    TaskOrphaned,
    TaskInterruptedRecovered,
    WorkerStarted,
    WorkerStopped,
    GuardAcquired,
    GuardReleased,
    GuardAdmissionRejected,
    GpuProbeFailed,
    GpuStatsTick,
    ProviderRegistered,
    ProviderUnregistered,
    ProviderLazyCreated,
    ProviderCleanup,
    ModelLoaded,
    ModelUnloaded,
    ModelEvicted,
    WebhookSent,
    WebhookRetry,
    WebhookGivenUp,
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    ConversationMessageAppended,
    WsConnected,
    WsDisconnected,
    WsSubscriptionChanged,
    WsLagged,
    PresetCatalogLoaded,
}

impl LogEvent {
    /// The stable identifier string.
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::StoreConnected => "store.connected",
            LogEvent::StoreCommandRetrySucceeded => "store.command_retry_succeeded",
            LogEvent::StoreCommandRetryFailed => "store.command_retry_failed",
            LogEvent::SessionCreated => "store.session_created",
            LogEvent::SessionUpdated => "store.session_updated",
            LogEvent::SessionDeleted => "store.session_deleted",
            LogEvent::TaskEnqueued => "store.task_enqueued",
            LogEvent::TaskDequeued => "store.task_dequeued",
            LogEvent::TaskSubmitted => "dispatch.task_submitted",
            LogEvent::TaskIdempotentHit => "dispatch.idempotent_hit",
            LogEvent::TaskProcessingStarted => "dispatch.processing_started",
            LogEvent::TaskCompleted => "dispatch.task_completed",
            LogEvent::TaskFailed => "dispatch.task_failed",
            LogEvent::TaskOrphaned => "dispatch.task_orphaned",
            LogEvent::TaskInterruptedRecovered => "dispatch.interrupted_recovered",
            LogEvent::WorkerStarted => "dispatch.worker_started",
            LogEvent::WorkerStopped => "dispatch.worker_stopped",
            LogEvent::GuardAcquired => "gpu.guard_acquired",
            LogEvent::GuardReleased => "gpu.guard_released",
            LogEvent::GuardAdmissionRejected => "gpu.admission_rejected",
            LogEvent::GpuProbeFailed => "gpu.probe_failed",
            LogEvent::GpuStatsTick => "gpu.stats_tick",
            LogEvent::ProviderRegistered => "provider.registered",
            LogEvent::ProviderUnregistered => "provider.unregistered",
            LogEvent::ProviderLazyCreated => "provider.lazy_created",
            LogEvent::ProviderCleanup => "provider.cleanup",
            LogEvent::ModelLoaded => "provider.model_loaded",
            LogEvent::ModelUnloaded => "provider.model_unloaded",
            LogEvent::ModelEvicted => "provider.model_evicted",
            LogEvent::WebhookSent => "webhook.sent",
            LogEvent::WebhookRetry => "webhook.retry",
            LogEvent::WebhookGivenUp => "webhook.given_up",
            LogEvent::ConversationCreated => "store.conversation_created",
            LogEvent::ConversationUpdated => "store.conversation_updated",
            LogEvent::ConversationDeleted => "store.conversation_deleted",
            LogEvent::ConversationMessageAppended => "store.conversation_message_appended",
            LogEvent::WsConnected => "ws.connected",
            LogEvent::WsDisconnected => "ws.disconnected",
            LogEvent::WsSubscriptionChanged => "ws.subscription_changed",
            LogEvent::WsLagged => "ws.lagged",
            LogEvent::PresetCatalogLoaded => "provider.preset_catalog_loaded",
        }
    }

    /// Every registered identifier, for uniqueness tests.
    pub const ALL: &'static [LogEvent] = &[
        LogEvent::StoreConnected,
        LogEvent::StoreCommandRetrySucceeded,
        LogEvent::StoreCommandRetryFailed,
        LogEvent::SessionCreated,
        LogEvent::SessionUpdated,
        LogEvent::SessionDeleted,
        LogEvent::TaskEnqueued,
        LogEvent::TaskDequeued,
        LogEvent::TaskSubmitted,
        LogEvent::TaskIdempotentHit,
        LogEvent::TaskProcessingStarted,
        LogEvent::TaskCompleted,
        LogEvent::TaskFailed,
        LogEvent::TaskOrphaned,
        LogEvent::TaskInterruptedRecovered,
        LogEvent::WorkerStarted,
        LogEvent::WorkerStopped,
        LogEvent::GuardAcquired,
        LogEvent::GuardReleased,
        LogEvent::GuardAdmissionRejected,
        LogEvent::GpuProbeFailed,
        LogEvent::GpuStatsTick,
        LogEvent::ProviderRegistered,
        LogEvent::ProviderUnregistered,
        LogEvent::ProviderLazyCreated,
        LogEvent::ProviderCleanup,
        LogEvent::ModelLoaded,
        LogEvent::ModelUnloaded,
        LogEvent::ModelEvicted,
        LogEvent::WebhookSent,
        LogEvent::WebhookRetry,
        LogEvent::WebhookGivenUp,
        LogEvent::ConversationCreated,
        LogEvent::ConversationUpdated,
        LogEvent::ConversationDeleted,
        LogEvent::ConversationMessageAppended,
        LogEvent::WsConnected,
        LogEvent::WsDisconnected,
        LogEvent::WsSubscriptionChanged,
        LogEvent::WsLagged,
        LogEvent::PresetCatalogLoaded,
    ];
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::LogEvent;

    #[test]
    fn ids_are_non_empty_and_unique() {
        let mut seen = HashSet::new();
        for event in LogEvent::ALL {
            let id = event.as_str();
            assert!(!id.is_empty());
            assert!(seen.insert(id), "duplicate log event id: {id}");
        }
    }

    #[test]
    fn ids_follow_namespace_convention() {
        for event in LogEvent::ALL {
            let id = event.as_str();
            assert!(
                id.starts_with("store.")
                    || id.starts_with("dispatch.")
                    || id.starts_with("gpu.")
                    || id.starts_with("provider.")
                    || id.starts_with("webhook.")
                    || id.starts_with("ws."),
                "unexpected event namespace: {id}"
            );
        }
    }
}
