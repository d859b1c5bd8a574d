//! Capability oracle (§3, §6.4): a read-only view of host CPU/RAM/GPU. The cache
//! must be cleared on every LLM or diffusion server start/stop transition (§4.4,
//! §5) — consumers must never hold a snapshot across such a boundary.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuType {
    None,
    Cuda,
    Vulkan,
    Metal,
    OpenCl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cores: usize,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub available: bool,
    pub gpu_type: GpuType,
    pub vram: Option<u64>,
    pub vram_available: Option<u64>,
}

/// Read-only view of host capability. Mirrors §3's "Capability snapshot".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub gpu: GpuInfo,
}

#[async_trait::async_trait]
pub trait CapabilityOracle: Send + Sync {
    async fn snapshot(&self) -> CapabilitySnapshot;
    fn clear_cache(&self);
}

/// sysinfo-backed oracle. GPU VRAM figures come from `nvidia-smi` probing (the
/// same subprocess-probe idiom used for GPU backend auto-detection) since
/// sysinfo itself has no VRAM accessor; absence of `nvidia-smi` degrades to
/// "GPU unavailable" rather than erroring.
pub struct SystemCapabilityOracle {
    cached: RwLock<Option<CapabilitySnapshot>>,
}

impl Default for SystemCapabilityOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCapabilityOracle {
    pub fn new() -> Self {
        Self {
            cached: RwLock::new(None),
        }
    }

    fn probe() -> CapabilitySnapshot {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu = CpuInfo {
            cores: sys.cpus().len().max(1),
            arch: std::env::consts::ARCH.to_string(),
        };
        let memory = MemoryInfo {
            total: sys.total_memory(),
            available: sys.available_memory(),
        };
        let gpu = Self::probe_gpu();

        CapabilitySnapshot { cpu, memory, gpu }
    }

    fn probe_gpu() -> GpuInfo {
        if let Some((vram_total, vram_free)) = Self::nvidia_smi_vram() {
            return GpuInfo {
                available: true,
                gpu_type: GpuType::Cuda,
                vram: Some(vram_total),
                vram_available: Some(vram_free),
            };
        }
        if Self::vulkaninfo_available() {
            return GpuInfo {
                available: true,
                gpu_type: GpuType::Vulkan,
                vram: None,
                vram_available: None,
            };
        }
        GpuInfo {
            available: false,
            gpu_type: GpuType::None,
            vram: None,
            vram_available: None,
        }
    }

    /// Queries `nvidia-smi --query-gpu=memory.total,memory.free` in MiB, returns
    /// bytes. Returns `None` if nvidia-smi is absent or reports nothing usable —
    /// this is treated as "no CUDA GPU", not an error (§7: capability probing
    /// failures are swallowed, never fatal).
    fn nvidia_smi_vram() -> Option<(u64, u64)> {
        let output = std::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.total,memory.free", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let first_line = text.lines().next()?;
        let mut parts = first_line.split(',').map(|s| s.trim());
        let total_mib: u64 = parts.next()?.parse().ok()?;
        let free_mib: u64 = parts.next()?.parse().ok()?;
        Some((total_mib * 1024 * 1024, free_mib * 1024 * 1024))
    }

    fn vulkaninfo_available() -> bool {
        std::process::Command::new("vulkaninfo")
            .arg("--summary")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl CapabilityOracle for SystemCapabilityOracle {
    async fn snapshot(&self) -> CapabilitySnapshot {
        if let Some(cached) = self.cached.read().clone() {
            return cached;
        }
        let snapshot = tokio::task::spawn_blocking(Self::probe)
            .await
            .unwrap_or_else(|_| CapabilitySnapshot {
                cpu: CpuInfo {
                    cores: 1,
                    arch: std::env::consts::ARCH.to_string(),
                },
                memory: MemoryInfo {
                    total: 0,
                    available: 0,
                },
                gpu: GpuInfo {
                    available: false,
                    gpu_type: GpuType::None,
                    vram: None,
                    vram_available: None,
                },
            });
        *self.cached.write() = Some(snapshot.clone());
        snapshot
    }

    fn clear_cache(&self) {
        *self.cached.write() = None;
    }
}
