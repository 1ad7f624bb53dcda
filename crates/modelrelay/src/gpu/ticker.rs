//! Background GPU telemetry broadcaster.
//!
//! Publishes a `gpu_stats` event on a fixed interval while at least one
//! subscriber is listening, and caches the snapshot in the store with a
//! short TTL. A failing probe skips the tick: GPU-less deployments are
//! normal.

use std::sync::Arc;
use std::time::Duration;

use modelrelay_events::{EventBus, GatewayEvent, kinds};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::gpu::{GpuGuard, VramMonitor};
use crate::observability::LogEvent;
use crate::store::TaskStore;

/// Spawn the telemetry ticker; it stops when `shutdown` flips to true.
pub fn spawn_gpu_stats_ticker(
    monitor: Arc<VramMonitor>,
    guard: Arc<GpuGuard>,
    store: Arc<TaskStore>,
    bus: EventBus,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if bus.subscriber_count() == 0 {
                continue;
            }
            let (gpu_info, vram_usage) =
                match (monitor.gpu_info().await, monitor.vram_usage().await) {
                    (Ok(info), Ok(usage)) => (info, usage),
                    (Err(err), _) | (_, Err(err)) => {
                        tracing::debug!(
                            event = LogEvent::GpuProbeFailed.as_str(),
                            error = %err,
                            "GPU stats unavailable; skipping tick"
                        );
                        continue;
                    }
                };
            let data = json!({
                "gpu_info": gpu_info,
                "vram_usage": vram_usage,
                "is_locked": guard.is_locked(),
                "current_task_id": guard.current_task_id(),
            });
            bus.publish(GatewayEvent::new(kinds::GPU_STATS, data.clone()));
            if let Err(err) = store.cache_gpu_stats(&data).await {
                tracing::debug!(error = %err, "could not cache GPU stats");
            }
            tracing::trace!(event = LogEvent::GpuStatsTick.as_str(), "gpu stats tick");
        }
    })
}
