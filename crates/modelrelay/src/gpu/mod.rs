//! Exclusive-GPU discipline: guard, VRAM monitor, telemetry ticker.

pub mod guard;
pub mod ticker;
pub mod vram;

pub use guard::{GpuGuard, GpuPermit};
pub use ticker::spawn_gpu_stats_ticker;
pub use vram::{GpuInfo, GpuProbe, GpuSnapshot, NvidiaSmiProbe, StaticProbe, VramMonitor, VramUsage};
