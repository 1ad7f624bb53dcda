//! Residency manager for local models: insertion-ordered map of resident
//! models, VRAM-bounded FIFO eviction, LRU-style promotion on access.
//!
//! Eviction and insertion run under one mutex, so the resident set always
//! satisfies the admission bound or is empty.

use std::sync::Arc;

use indexmap::IndexMap;
use modelrelay_events::{EventBus, GatewayEvent, kinds};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::gpu::VramMonitor;
use crate::observability::LogEvent;
use crate::providers::Provider;

/// Ordered set of resident local models plus the eviction policy.
pub struct ModelResidency {
    resident: Mutex<IndexMap<String, Arc<dyn Provider>>>,
    monitor: Arc<VramMonitor>,
    bus: EventBus,
}

impl ModelResidency {
    /// Build a residency manager.
    pub fn new(monitor: Arc<VramMonitor>, bus: EventBus) -> Self {
        Self {
            resident: Mutex::new(IndexMap::new()),
            monitor,
            bus,
        }
    }

    /// Make `provider` resident before generation.
    ///
    /// No-op for providers without the local-control capability. A model
    /// that is already resident is promoted to the tail (hot-path skip).
    /// Otherwise the oldest residents are evicted until the monitor admits
    /// the requirement; if the set empties first, loading proceeds anyway
    /// with a warning.
    pub async fn ensure_resident(&self, name: &str, provider: &Arc<dyn Provider>) -> Result<()> {
        let Some(control) = provider.local_control() else {
            return Ok(());
        };

        let mut resident = self.resident.lock().await;
        if resident.shift_remove(name).is_some() {
            resident.insert(name.to_string(), Arc::clone(provider));
            tracing::debug!(model = name, "model already resident; promoted");
            return Ok(());
        }

        let required_mb = control.required_vram_mb();
        loop {
            match self.monitor.can_allocate(required_mb).await {
                Ok(true) => break,
                Ok(false) => {}
                // Without telemetry there is nothing to account against;
                // the load itself will fail if the device is truly gone.
                Err(err) => {
                    tracing::warn!(
                        event = LogEvent::GpuProbeFailed.as_str(),
                        model = name,
                        error = %err,
                        "VRAM probe failed during residency check; loading anyway"
                    );
                    break;
                }
            }
            let Some((oldest_name, oldest_provider)) = resident.shift_remove_index(0) else {
                tracing::warn!(
                    model = name,
                    required_mb,
                    "insufficient VRAM and nothing left to evict; loading anyway"
                );
                break;
            };
            self.evict(&oldest_name, &oldest_provider).await;
        }

        control.load().await?;
        resident.insert(name.to_string(), Arc::clone(provider));
        self.bus.publish(GatewayEvent::new(
            kinds::MODEL_LOADED,
            json!({ "model": name, "required_vram_mb": required_mb }),
        ));
        Ok(())
    }

    async fn evict(&self, name: &str, provider: &Arc<dyn Provider>) {
        tracing::info!(
            event = LogEvent::ModelEvicted.as_str(),
            model = name,
            "evicting oldest resident model"
        );
        if let Some(control) = provider.local_control() {
            if let Err(err) = control.unload().await {
                tracing::warn!(model = name, error = %err, "eviction unload failed");
            }
        }
        self.bus.publish(GatewayEvent::new(
            kinds::MODEL_UNLOADED,
            json!({ "model": name, "reason": "evicted" }),
        ));
    }

    /// Explicitly unload one model. Returns whether it was resident.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut resident = self.resident.lock().await;
            resident.shift_remove(name)
        };
        let Some(provider) = removed else {
            return Ok(false);
        };
        if let Some(control) = provider.local_control() {
            control.unload().await?;
        }
        self.bus.publish(GatewayEvent::new(
            kinds::MODEL_UNLOADED,
            json!({ "model": name, "reason": "unloaded" }),
        ));
        Ok(true)
    }

    /// Resident model names, oldest first.
    pub async fn list_resident(&self) -> Vec<String> {
        self.resident.lock().await.keys().cloned().collect()
    }

    /// Unload everything (shutdown path).
    pub async fn cleanup(&self) {
        let drained: Vec<(String, Arc<dyn Provider>)> = {
            let mut resident = self.resident.lock().await;
            resident.drain(..).collect()
        };
        for (name, provider) in drained {
            if let Some(control) = provider.local_control() {
                if let Err(err) = control.unload().await {
                    tracing::warn!(model = %name, error = %err, "cleanup unload failed");
                }
            }
        }
    }
}
