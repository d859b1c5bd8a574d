//! Resource Orchestrator (§4.4): decides whether to offload the LLM before a
//! diffusion job, saves/restores its configuration, reloads it in the
//! background with one retry. The "pending reload" single-slot handle
//! implements §9's guidance to model "background reload, don't block the
//! caller" as a task read-and-awaited at the next `orchestrate()` entry.

use crate::capability::CapabilityOracle;
use crate::error::Result;
use crate::llm_collaborator::{LlmServerManager, SavedLlmState};
use crate::model_manager::ModelInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const RELOAD_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Used only when neither the saved LLM config nor model metadata carries a
/// layer count (§9 open question: "totalLayers hard-coded to 32 is wrong for
/// models with different layer counts" — kept as the last-resort default,
/// exposed as a parameter everywhere a real count is available).
const DEFAULT_TOTAL_LAYERS: u32 = 32;

const VRAM_OVERHEAD_FACTOR: f64 = 1.2;
const OFFLOAD_THRESHOLD: f64 = 0.75;

pub struct Orchestrator {
    capability: Arc<dyn CapabilityOracle>,
    llm: Arc<dyn LlmServerManager>,
    saved_state: Arc<Mutex<Option<SavedLlmState>>>,
    pending_reload: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(capability: Arc<dyn CapabilityOracle>, llm: Arc<dyn LlmServerManager>) -> Self {
        Self {
            capability,
            llm,
            saved_state: Arc::new(Mutex::new(None)),
            pending_reload: Mutex::new(None),
        }
    }

    pub fn saved_state(&self) -> Option<SavedLlmState> {
        self.saved_state.lock().clone()
    }

    pub fn clear_saved_state(&self) {
        *self.saved_state.lock() = None;
    }

    /// Awaits any prior pending reload before making a decision — otherwise a
    /// caller might observe "LLM running" stale from before a reload completed
    /// (§5 ordering guarantee).
    async fn await_pending_reload(&self) {
        let handle = self.pending_reload.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// §4.4's `wouldNeedOffload()`.
    async fn would_need_offload(&self, diffusion_model: &ModelInfo, llm_running: bool) -> bool {
        let snapshot = self.capability.snapshot().await;

        let diffusion_usage = diffusion_model.size as f64 * VRAM_OVERHEAD_FACTOR;

        let llm_usage = if llm_running {
            if let Some(config) = self.llm.get_config().await {
                let total_layers = config
                    .total_layers
                    .or_else(|| diffusion_model.total_layers())
                    .unwrap_or(DEFAULT_TOTAL_LAYERS) as f64;
                let split = (config.gpu_layers as f64 / total_layers.max(1.0)).clamp(0.0, 1.0);
                config.size_bytes.unwrap_or(0) as f64 * split * VRAM_OVERHEAD_FACTOR
            } else {
                0.0
            }
        } else {
            0.0
        };

        let vram_total = snapshot.gpu.vram.unwrap_or(0) as f64;
        let ram_total = snapshot.memory.total as f64;

        let vram_ratio = if vram_total > 0.0 {
            (llm_usage + diffusion_usage) / vram_total
        } else {
            1.0
        };
        let ram_ratio = if ram_total > 0.0 {
            (llm_usage + diffusion_usage) / ram_total
        } else {
            0.0
        };

        vram_ratio > OFFLOAD_THRESHOLD || ram_ratio > OFFLOAD_THRESHOLD
    }

    /// §4.4's offload protocol. `execute` is the DSM's internal execute path —
    /// passed in as a closure so the orchestrator has no compile-time
    /// dependency on the diffusion module (keeps the dependency order leaf-first
    /// per §2).
    pub async fn orchestrate<F, Fut, T>(
        &self,
        diffusion_model: &ModelInfo,
        execute: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.await_pending_reload().await;

        let was_running = self.llm.is_running().await;
        let needs_offload = was_running && self.would_need_offload(diffusion_model, was_running).await;

        if !needs_offload {
            return execute().await;
        }

        let config = self.llm.get_config().await;
        if let Some(config) = config.clone() {
            *self.saved_state.lock() = Some(SavedLlmState {
                config,
                was_running: true,
                saved_at: chrono::Utc::now(),
            });
        }
        info!("offloading LLM server before diffusion job");
        if let Err(e) = self.llm.stop().await {
            warn!(error = %e, "failed to stop LLM server during offload");
        }
        self.capability.clear_cache();

        let result = execute().await;

        if let Some(config) = config {
            self.spawn_reload(config);
        }

        result
    }

    /// §4.4 step 5: background reload task. On failure, wait 2s, clear the
    /// capability cache (memory may have changed), retry once.
    fn spawn_reload(&self, config: crate::llm_collaborator::LlmConfig) {
        let llm = self.llm.clone();
        let capability = self.capability.clone();
        let saved_state = self.saved_state.clone();

        let handle = tokio::spawn(async move {
            if llm.start(config.clone()).await.is_ok() {
                info!("LLM reload succeeded on first attempt");
                *saved_state.lock() = None;
                return;
            }
            tokio::time::sleep(RELOAD_RETRY_DELAY).await;
            capability.clear_cache();
            if llm.start(config).await.is_ok() {
                info!("LLM reload succeeded on retry");
                *saved_state.lock() = None;
            } else {
                error!("LLM reload failed after retry; saved state retained");
            }
        });
        *self.pending_reload.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilitySnapshot, CpuInfo, GpuInfo, GpuType, MemoryInfo};
    use crate::llm_collaborator::LlmConfig;
    use crate::model_manager::{ModelKind, Provenance};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeOracle {
        vram_total: u64,
        vram_available: u64,
    }

    #[async_trait]
    impl CapabilityOracle for FakeOracle {
        async fn snapshot(&self) -> CapabilitySnapshot {
            CapabilitySnapshot {
                cpu: CpuInfo {
                    cores: 8,
                    arch: "x86_64".into(),
                },
                memory: MemoryInfo {
                    total: 32 * 1024 * 1024 * 1024,
                    available: 16 * 1024 * 1024 * 1024,
                },
                gpu: GpuInfo {
                    available: true,
                    gpu_type: GpuType::Cuda,
                    vram: Some(self.vram_total),
                    vram_available: Some(self.vram_available),
                },
            }
        }
        fn clear_cache(&self) {}
    }

    struct FakeLlm {
        running: AtomicBool,
        config: LlmConfig,
    }

    #[async_trait]
    impl LlmServerManager for FakeLlm {
        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        async fn get_config(&self) -> Option<LlmConfig> {
            Some(self.config.clone())
        }
        async fn start(&self, _config: LlmConfig) -> anyhow::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn model(size: u64) -> ModelInfo {
        ModelInfo {
            id: "sd".into(),
            display_name: "sd".into(),
            kind: ModelKind::Diffusion,
            path: "sd.gguf".into(),
            components: HashMap::new(),
            size,
            provenance: Provenance::Url { url: "x".into() },
            expected_checksum: None,
            downloaded_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn no_offload_when_llm_not_running() {
        let oracle = Arc::new(FakeOracle {
            vram_total: 24 * 1024 * 1024 * 1024,
            vram_available: 24 * 1024 * 1024 * 1024,
        });
        let llm = Arc::new(FakeLlm {
            running: AtomicBool::new(false),
            config: LlmConfig {
                model_id: "llama".into(),
                port: 8080,
                gpu_layers: 35,
                total_layers: Some(40),
                size_bytes: Some(4_000_000_000),
            },
        });
        let orch = Orchestrator::new(oracle, llm.clone());
        let m = model(1_000_000_000);
        let result = orch.orchestrate(&m, || async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert!(!llm.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn offload_stops_llm_and_schedules_reload() {
        let oracle = Arc::new(FakeOracle {
            vram_total: 6 * 1024 * 1024 * 1024,
            vram_available: 1 * 1024 * 1024 * 1024,
        });
        let llm = Arc::new(FakeLlm {
            running: AtomicBool::new(true),
            config: LlmConfig {
                model_id: "llama-2-7b".into(),
                port: 8080,
                gpu_layers: 35,
                total_layers: Some(40),
                size_bytes: Some(4_000_000_000),
            },
        });
        let orch = Orchestrator::new(oracle, llm.clone());
        let m = model(6_500_000_000);

        let result = orch.orchestrate(&m, || async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
        // stop() was called synchronously inside orchestrate before execute ran
        orch.await_pending_reload().await;
        assert!(llm.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clear_saved_state_is_idempotent() {
        let oracle = Arc::new(FakeOracle {
            vram_total: 24 * 1024 * 1024 * 1024,
            vram_available: 24 * 1024 * 1024 * 1024,
        });
        let llm = Arc::new(FakeLlm {
            running: AtomicBool::new(false),
            config: LlmConfig {
                model_id: "llama".into(),
                port: 8080,
                gpu_layers: 0,
                total_layers: None,
                size_bytes: None,
            },
        });
        let orch = Orchestrator::new(oracle, llm);
        orch.clear_saved_state();
        orch.clear_saved_state();
        assert!(orch.saved_state().is_none());
    }
}
