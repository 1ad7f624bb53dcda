//! Exclusive GPU access for the single-worker dispatcher.
//!
//! One mutex, one in-flight holder. An optional VRAM admission check runs
//! *before* queueing on the lock so an oversized task fails fast instead of
//! occupying the queue head. Release happens on every exit path via the
//! permit's `Drop`.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::gpu::VramMonitor;
use crate::observability::LogEvent;

/// Mutex-plus-admission component ensuring one-at-a-time GPU use.
pub struct GpuGuard {
    lock: Mutex<()>,
    current_task: StdMutex<Option<String>>,
    monitor: Arc<VramMonitor>,
}

/// Scoped acquisition; dropping it frees the GPU.
pub struct GpuPermit<'a> {
    _lock: MutexGuard<'a, ()>,
    guard: &'a GpuGuard,
    task_id: String,
}

impl GpuGuard {
    /// Build a guard over the given monitor.
    pub fn new(monitor: Arc<VramMonitor>) -> Self {
        Self {
            lock: Mutex::new(()),
            current_task: StdMutex::new(None),
            monitor,
        }
    }

    /// Acquire exclusive GPU access for `task_id`.
    ///
    /// When `required_vram_mb` is given, admission is checked first: if the
    /// monitor reports insufficient allocatable VRAM the acquisition fails
    /// immediately with `vram-insufficient`, without waiting on the lock.
    pub async fn acquire(
        &self,
        task_id: &str,
        required_vram_mb: Option<u64>,
    ) -> Result<GpuPermit<'_>> {
        if let Some(required_mb) = required_vram_mb {
            let available_mb = self.monitor.available_vram_mb().await?;
            if available_mb < required_mb {
                tracing::warn!(
                    event = LogEvent::GuardAdmissionRejected.as_str(),
                    task_id,
                    required_mb,
                    available_mb,
                    "VRAM admission check failed"
                );
                return Err(Error::VramInsufficient {
                    required_mb,
                    available_mb,
                });
            }
        }

        tracing::debug!(task_id, "waiting for GPU lock");
        let lock = self.lock.lock().await;
        if let Ok(mut current) = self.current_task.lock() {
            *current = Some(task_id.to_string());
        }
        tracing::info!(
            event = LogEvent::GuardAcquired.as_str(),
            task_id,
            "GPU lock acquired"
        );
        Ok(GpuPermit {
            _lock: lock,
            guard: self,
            task_id: task_id.to_string(),
        })
    }

    /// Whether the GPU is currently held.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Task currently holding the GPU, if any.
    pub fn current_task_id(&self) -> Option<String> {
        self.current_task.lock().ok().and_then(|c| c.clone())
    }

    /// Wait until the GPU is free. Returns `false` on timeout instead of
    /// raising.
    pub async fn wait_until_free(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                drop(self.lock.lock().await);
                true
            }
            Some(limit) => match tokio::time::timeout(limit, self.lock.lock()).await {
                Ok(lock) => {
                    drop(lock);
                    true
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = limit.as_secs_f64(),
                        current_task = ?self.current_task_id(),
                        "GPU wait timed out"
                    );
                    false
                }
            },
        }
    }

    /// The monitor this guard consults for admission.
    pub fn monitor(&self) -> &VramMonitor {
        &self.monitor
    }
}

impl Drop for GpuPermit<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.guard.current_task.lock() {
            *current = None;
        }
        tracing::info!(
            event = LogEvent::GuardReleased.as_str(),
            task_id = %self.task_id,
            "GPU lock released"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gpu::StaticProbe;

    fn guard(total_mb: u64, used_mb: u64) -> GpuGuard {
        let monitor = Arc::new(VramMonitor::new(
            Box::new(StaticProbe::new(total_mb, used_mb)),
            0,
            95,
            1024,
        ));
        GpuGuard::new(monitor)
    }

    #[tokio::test]
    async fn acquire_records_holder_and_release_clears_it() {
        let guard = guard(24_000, 0);
        assert!(!guard.is_locked());
        {
            let _permit = guard.acquire("task-1", None).await.unwrap();
            assert!(guard.is_locked());
            assert_eq!(guard.current_task_id().as_deref(), Some("task-1"));
        }
        assert!(!guard.is_locked());
        assert!(guard.current_task_id().is_none());
    }

    #[tokio::test]
    async fn admission_rejects_before_queueing() {
        let guard = guard(8_000, 7_000);
        let err = guard.acquire("task-1", Some(50_000)).await.err().unwrap();
        assert!(matches!(err, Error::VramInsufficient { .. }));
        // The failed admission never touched the lock.
        assert!(!guard.is_locked());
    }

    #[tokio::test]
    async fn wait_until_free_times_out_while_held() {
        let guard = guard(24_000, 0);
        let permit = guard.acquire("task-1", None).await.unwrap();
        assert!(
            !guard
                .wait_until_free(Some(Duration::from_millis(20)))
                .await
        );
        drop(permit);
        assert!(
            guard
                .wait_until_free(Some(Duration::from_millis(20)))
                .await
        );
    }

    #[tokio::test]
    async fn second_acquire_blocks_until_release() {
        let guard = Arc::new(guard(24_000, 0));
        let permit = guard.acquire("task-1", None).await.unwrap();

        let contender = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                let _permit = guard.acquire("task-2", None).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(permit);
        contender.await.unwrap();
    }
}
