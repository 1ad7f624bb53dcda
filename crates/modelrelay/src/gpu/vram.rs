//! VRAM accounting over a pluggable telemetry probe.
//!
//! The production probe shells out to `nvidia-smi`; tests inject a probe
//! with fixed values. All reads surface `gpu-unavailable` when the device
//! interface is inoperative.

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::error::{Error, Result};

/// One raw reading from the device interface.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    /// Device name, e.g. `NVIDIA GeForce RTX 4090`.
    pub name: String,
    /// Driver version string.
    pub driver_version: String,
    /// CUDA version string.
    pub cuda_version: String,
    /// Total VRAM in MB.
    pub total_mb: u64,
    /// Used VRAM in MB.
    pub used_mb: u64,
    /// Core temperature in Celsius, when reported.
    pub temperature_celsius: Option<u32>,
    /// GPU utilization percent, when reported.
    pub gpu_utilization_percent: Option<u32>,
}

/// VRAM usage figures derived from a snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VramUsage {
    /// Total VRAM in MB.
    pub total_mb: u64,
    /// Used VRAM in MB.
    pub used_mb: u64,
    /// Free VRAM in MB.
    pub free_mb: u64,
    /// Used fraction as a percentage.
    pub used_percent: f64,
}

/// Static device metadata for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    /// Device name.
    pub name: String,
    /// Monitored device index.
    pub index: u32,
    /// Driver version.
    pub driver_version: String,
    /// CUDA version.
    pub cuda_version: String,
    /// Core temperature in Celsius.
    pub temperature_celsius: Option<u32>,
    /// Utilization percent.
    pub gpu_utilization_percent: Option<u32>,
}

/// Read-only interface over device telemetry.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Take one reading; `gpu-unavailable` when the interface is down.
    async fn snapshot(&self) -> Result<GpuSnapshot>;
}

/// Probe backed by `nvidia-smi` CSV output.
pub struct NvidiaSmiProbe {
    gpu_index: u32,
}

impl NvidiaSmiProbe {
    /// Probe for one device index.
    pub fn new(gpu_index: u32) -> Self {
        Self { gpu_index }
    }

    fn parse_csv_line(line: &str) -> Option<GpuSnapshot> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 7 {
            return None;
        }
        Some(GpuSnapshot {
            name: fields[0].to_string(),
            driver_version: fields[1].to_string(),
            cuda_version: fields[2].to_string(),
            total_mb: fields[3].parse().ok()?,
            used_mb: fields[4].parse().ok()?,
            temperature_celsius: fields[5].parse().ok(),
            gpu_utilization_percent: fields[6].parse().ok(),
        })
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmiProbe {
    async fn snapshot(&self) -> Result<GpuSnapshot> {
        let output = Command::new("nvidia-smi")
            .arg(format!("--id={}", self.gpu_index))
            .arg("--query-gpu=name,driver_version,cuda_version,memory.total,memory.used,temperature.gpu,utilization.gpu")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await
            .map_err(|err| Error::GpuUnavailable(format!("nvidia-smi not runnable: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::GpuUnavailable(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .and_then(Self::parse_csv_line)
            .ok_or_else(|| {
                Error::GpuUnavailable(format!(
                    "unparsable nvidia-smi output: {}",
                    stdout.trim()
                ))
            })
    }
}

/// Probe returning fixed values; used by tests and GPU-less deployments.
pub struct StaticProbe {
    total_mb: u64,
    used_mb: u64,
}

impl StaticProbe {
    /// Probe with fixed total/used MB.
    pub fn new(total_mb: u64, used_mb: u64) -> Self {
        Self { total_mb, used_mb }
    }
}

#[async_trait]
impl GpuProbe for StaticProbe {
    async fn snapshot(&self) -> Result<GpuSnapshot> {
        Ok(GpuSnapshot {
            name: "static-gpu".to_string(),
            driver_version: "0.0".to_string(),
            cuda_version: "0.0".to_string(),
            total_mb: self.total_mb,
            used_mb: self.used_mb,
            temperature_celsius: Some(40),
            gpu_utilization_percent: Some(0),
        })
    }
}

/// VRAM accounting with a usage cap and a system reserve.
pub struct VramMonitor {
    probe: Box<dyn GpuProbe>,
    gpu_index: u32,
    max_vram_percent: u32,
    reserve_mb: u64,
}

impl VramMonitor {
    /// Build a monitor over a probe with the configured admission limits.
    pub fn new(probe: Box<dyn GpuProbe>, gpu_index: u32, max_vram_percent: u32, reserve_mb: u64) -> Self {
        Self {
            probe,
            gpu_index,
            max_vram_percent,
            reserve_mb,
        }
    }

    /// Current VRAM usage.
    pub async fn vram_usage(&self) -> Result<VramUsage> {
        let snapshot = self.probe.snapshot().await?;
        let free_mb = snapshot.total_mb.saturating_sub(snapshot.used_mb);
        let used_percent = if snapshot.total_mb == 0 {
            0.0
        } else {
            (snapshot.used_mb as f64 / snapshot.total_mb as f64) * 100.0
        };
        Ok(VramUsage {
            total_mb: snapshot.total_mb,
            used_mb: snapshot.used_mb,
            free_mb,
            used_percent,
        })
    }

    /// Allocatable VRAM: `(total · cap%) − used − reserve`, clamped at 0.
    pub async fn available_vram_mb(&self) -> Result<u64> {
        let usage = self.vram_usage().await?;
        let max_allowed_mb =
            (usage.total_mb as f64 * f64::from(self.max_vram_percent) / 100.0) as i64;
        let available = max_allowed_mb - usage.used_mb as i64 - self.reserve_mb as i64;
        Ok(available.max(0) as u64)
    }

    /// Whether `required_mb` can be allocated right now.
    pub async fn can_allocate(&self, required_mb: u64) -> Result<bool> {
        Ok(self.available_vram_mb().await? >= required_mb)
    }

    /// Device metadata for telemetry.
    pub async fn gpu_info(&self) -> Result<GpuInfo> {
        let snapshot = self.probe.snapshot().await?;
        Ok(GpuInfo {
            name: snapshot.name,
            index: self.gpu_index,
            driver_version: snapshot.driver_version,
            cuda_version: snapshot.cuda_version,
            temperature_celsius: snapshot.temperature_celsius,
            gpu_utilization_percent: snapshot.gpu_utilization_percent,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn available_vram_honors_cap_and_reserve() {
        // 24000 total, 4000 used, cap 95%, reserve 1024:
        // 24000*0.95 - 4000 - 1024 = 17776
        let monitor = VramMonitor::new(Box::new(StaticProbe::new(24_000, 4_000)), 0, 95, 1024);
        assert_eq!(monitor.available_vram_mb().await.unwrap(), 17_776);
        assert!(monitor.can_allocate(17_776).await.unwrap());
        assert!(!monitor.can_allocate(17_777).await.unwrap());
    }

    #[tokio::test]
    async fn available_vram_clamps_at_zero() {
        let monitor = VramMonitor::new(Box::new(StaticProbe::new(8_000, 7_900)), 0, 95, 1024);
        assert_eq!(monitor.available_vram_mb().await.unwrap(), 0);
    }

    #[test]
    fn nvidia_smi_csv_parsing() {
        let line = "NVIDIA GeForce RTX 4090, 550.54.14, 12.4, 24564, 1234, 52, 17";
        let snapshot = NvidiaSmiProbe::parse_csv_line(line).unwrap();
        assert_eq!(snapshot.total_mb, 24_564);
        assert_eq!(snapshot.used_mb, 1_234);
        assert_eq!(snapshot.temperature_celsius, Some(52));
        assert!(NvidiaSmiProbe::parse_csv_line("garbage").is_none());
    }
}
