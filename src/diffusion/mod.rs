//! Diffusion Server Manager (§4.3): lifecycle state machine wiring BM, MMM,
//! the capability oracle, the Resource Orchestrator, the generation registry,
//! and the per-job pipeline together. Composition mirrors the donor main.rs's
//! `AppState` — one struct owning the long-lived collaborators, built once at
//! startup and handed to the HTTP layer.

pub mod http;
pub mod pipeline;
pub mod progress;
pub mod registry;

use crate::binary_manager::{BackendKind, BinaryManager, Variant};
use crate::capability::CapabilityOracle;
use crate::config::DiffusionConfig;
use crate::error::{CoreError, Result};
use crate::model_manager::{ModelInfo, ModelKind, ModelManager};
use crate::observability::ObservabilityManager;
use crate::orchestrator::Orchestrator;
use crate::port_manager::PortAllocator;
use parking_lot::RwLock;
use pipeline::{
    batch_seed, compose_batch_percentage, compute_vram_flags, normalize_seed, run_generation,
    GenerationRequest, JobCancelHandle,
};
use progress::TimeEstimator;
use registry::{GenerationRegistry, GenerationState, Status, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

struct RunningHandle {
    listener_addr: std::net::SocketAddr,
    gc_handle: JoinHandle<()>,
    shutdown: Arc<tokio::sync::Notify>,
    binary: PathBuf,
    binary_requires_cuda: bool,
    model: ModelInfo,
    config: DiffusionConfig,
}

/// Owns the per-server mutable lifecycle state. One instance per diffusion
/// server process (there is exactly one in this version — §1 Non-goals rules
/// out multiplexing several diffusion backends at once).
pub struct DiffusionServer {
    state: RwLock<LifecycleState>,
    running: RwLock<Option<RunningHandle>>,
    current_generation: Arc<AtomicBool>,
    current_cancel: RwLock<Option<JobCancelHandle>>,
    estimator: Arc<RwLock<TimeEstimator>>,
    registry: Arc<GenerationRegistry>,
    models: Arc<ModelManager>,
    binaries: Arc<BinaryManager>,
    capability: Arc<dyn CapabilityOracle>,
    orchestrator: Arc<Orchestrator>,
    ports: Arc<PortAllocator>,
    metrics: Arc<ObservabilityManager>,
}

impl DiffusionServer {
    pub fn new(
        models: Arc<ModelManager>,
        binaries: Arc<BinaryManager>,
        capability: Arc<dyn CapabilityOracle>,
        orchestrator: Arc<Orchestrator>,
        ports: Arc<PortAllocator>,
        metrics: Arc<ObservabilityManager>,
    ) -> Self {
        Self {
            state: RwLock::new(LifecycleState::Stopped),
            running: RwLock::new(None),
            current_generation: Arc::new(AtomicBool::new(false)),
            current_cancel: RwLock::new(None),
            estimator: Arc::new(RwLock::new(TimeEstimator::default())),
            registry: Arc::new(GenerationRegistry::new(DEFAULT_TTL)),
            models,
            binaries,
            capability,
            orchestrator,
            ports,
            metrics,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_busy(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
        self.running.read().as_ref().map(|h| h.listener_addr)
    }

    /// `stopped -> starting -> running` (§4.3.1). Validates config, model kind,
    /// capability fit, resolves the binary via BM, checks port availability,
    /// then opens the listener (the caller owns the actual axum `serve` task —
    /// this only performs the pre-flight checks and records the bound state).
    pub async fn start(
        &self,
        config: &DiffusionConfig,
        variants: Vec<Variant>,
        bind: &str,
    ) -> Result<std::net::SocketAddr> {
        {
            let mut state = self.state.write();
            if *state != LifecycleState::Stopped {
                return Err(CoreError::ServerError {
                    message: "diffusion server is already running".into(),
                });
            }
            *state = LifecycleState::Starting;
        }

        match self.try_start(config, variants, bind).await {
            Ok(addr) => {
                *self.state.write() = LifecycleState::Running;
                Ok(addr)
            }
            Err(e) => {
                // best-effort rollback: nothing persistent was opened besides
                // the port reservation, which release_port below undoes.
                *self.state.write() = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    async fn try_start(
        &self,
        config: &DiffusionConfig,
        variants: Vec<Variant>,
        bind: &str,
    ) -> Result<std::net::SocketAddr> {
        let model = self.models.load(&config.model_id).await?;
        if model.kind != ModelKind::Diffusion {
            return Err(CoreError::ModelNotFound {
                message: format!("model '{}' is not a diffusion model", config.model_id),
                suggestion: Some("select a model downloaded with kind=diffusion".into()),
            });
        }

        let snapshot = self.capability.snapshot().await;
        let footprint = model.size as f64 * 1.2;
        if (footprint as u64) > snapshot.memory.total {
            return Err(CoreError::InsufficientResources {
                message: format!(
                    "model footprint {footprint:.0} bytes exceeds total system memory {}",
                    snapshot.memory.total
                ),
            });
        }

        self.capability.clear_cache();

        let resolved = self
            .binaries
            .resolve(
                BackendKind::Diffusion,
                variants,
                Some(&model.path),
                std::env::consts::OS,
            )
            .await?;

        let addr = self.ports.resolve_bind_address(bind).map_err(|e| CoreError::PortInUse {
            message: e.to_string(),
        })?;

        let gc_handle = self.registry.clone().spawn_gc(DEFAULT_SWEEP_INTERVAL);

        *self.running.write() = Some(RunningHandle {
            listener_addr: addr,
            gc_handle,
            shutdown: Arc::new(tokio::sync::Notify::new()),
            binary: resolved.path,
            binary_requires_cuda: resolved.requires_cuda,
            model,
            config: config.clone(),
        });

        info!(%addr, "diffusion server started");
        Ok(addr)
    }

    /// `running -> stopping -> stopped` (§4.3.1, §5): cancels any in-flight job
    /// with SIGTERM+grace, drains the registry GC timer, closes the listener.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state.read();
            if *state != LifecycleState::Running {
                return Ok(());
            }
        }
        *self.state.write() = LifecycleState::Stopping;

        if let Some(cancel) = self.current_cancel.read().clone() {
            cancel.cancel();
        }

        let handle = self.running.write().take();
        if let Some(handle) = handle {
            handle.gc_handle.abort();
            handle.shutdown.notify_waiters();
        }

        self.capability.clear_cache();
        *self.state.write() = LifecycleState::Stopped;
        info!("diffusion server stopped");
        Ok(())
    }

    pub fn mark_crashed(&self) {
        *self.state.write() = LifecycleState::Crashed;
        error!("diffusion server listener reported an unrecoverable error");
    }

    pub fn registry(&self) -> Arc<GenerationRegistry> {
        self.registry.clone()
    }

    /// Accepts a new generation request, enqueues it, returns the pending
    /// `GenerationState` immediately (§4.3.2: the POST never blocks).
    pub fn accept_generation(&self, req: GenerationRequest) -> Result<GenerationState> {
        if self.state() != LifecycleState::Running {
            return Err(CoreError::ServerError {
                message: "diffusion server is not running".into(),
            });
        }
        if self
            .current_generation
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::ServerError {
                message: "a generation is already in-flight".into(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let state = GenerationState::new_pending(id.clone());
        self.registry.insert(state.clone());

        let (model, binary, binary_requires_cuda, config) = match self
            .running
            .read()
            .as_ref()
            .map(|h| (h.model.clone(), h.binary.clone(), h.binary_requires_cuda, h.config.clone()))
        {
            Some(quad) => quad,
            None => {
                self.current_generation.store(false, Ordering::SeqCst);
                return Err(CoreError::ServerError {
                    message: "diffusion server is not running".into(),
                });
            }
        };

        self.spawn_job(id, model, binary, binary_requires_cuda, config, req);
        self.registry
            .get(&state.id)
            .ok_or_else(|| CoreError::unknown("registry write failed"))
    }

    fn spawn_job(
        &self,
        id: String,
        model: ModelInfo,
        binary: PathBuf,
        binary_requires_cuda: bool,
        config: DiffusionConfig,
        req: GenerationRequest,
    ) {
        let registry = self.registry.clone();
        let current_generation = self.current_generation.clone();
        let cancel = JobCancelHandle::new();
        *self.current_cancel.write() = Some(cancel.clone());
        let capability = self.capability.clone();
        let orchestrator = self.orchestrator.clone();
        let estimator_handle = self.estimator.clone();
        let metrics = self.metrics.clone();
        let model_id = model.id.clone();

        registry.update(&id, |s| s.status = Status::InProgress);

        tokio::spawn(async move {
            let count = req.count.clamp(1, 5);
            let user_supplied_seed = req.seed >= 0;
            let base_seed = normalize_seed(req.seed);

            let mut images = Vec::new();
            let mut last_time_taken = 0u64;
            let mut format = "png".to_string();

            for i in 0..count {
                let seed = batch_seed(base_seed, i, user_supplied_seed);
                let mut sub_req = req.clone();
                sub_req.seed = seed;

                let snapshot = capability.snapshot().await;
                let flags = compute_vram_flags(&model, &snapshot, &config, binary_requires_cuda);

                let binary = binary.clone();
                let model_clone = model.clone();
                let req_clone = sub_req.clone();
                let cancel_clone = cancel.clone();
                let registry_clone = registry.clone();
                let id_clone = id.clone();
                let completed = i;
                let steps = sub_req.steps;

                // snapshot the server's learned calibration, write it back
                // after the job completes (§4.3.4: constants persist across
                // generations, not just within one).
                let estimator = *estimator_handle.read();
                let exec = move || async move {
                    run_generation(
                        &binary,
                        &model_clone,
                        &req_clone,
                        &flags,
                        config.threads,
                        seed,
                        &estimator,
                        cancel_clone,
                        move |update| {
                            let pct = compose_batch_percentage(
                                completed,
                                update.percentage,
                                count,
                            );
                            registry_clone.update(&id_clone, |s| {
                                s.progress = Some(registry::Progress {
                                    current_step: update.current_step,
                                    total_steps: update.total_steps,
                                    stage: update.stage,
                                    percentage: pct,
                                    current_image: Some(completed + 1),
                                    total_images: Some(count),
                                });
                            });
                        },
                    )
                    .await
                };

                // Orchestration applies only to the first sub-generation (§4.3.5).
                let outcome = if i == 0 {
                    orchestrator.orchestrate(&model, exec).await
                } else {
                    exec().await
                };

                match outcome {
                    Ok(outcome) => {
                        estimator_handle
                            .write()
                            .calibrate(&outcome.measured, steps, outcome.megapixels);
                        metrics
                            .record_generation(
                                &model_id,
                                Duration::from_millis(outcome.time_taken_ms),
                                true,
                            )
                            .await;
                        images.push(outcome.image);
                        last_time_taken += outcome.time_taken_ms;
                    }
                    Err(e) => {
                        warn!(error = %e, "generation failed");
                        metrics
                            .record_generation(&model_id, Duration::from_millis(last_time_taken), false)
                            .await;
                        registry.update(&id, |s| {
                            s.status = Status::Error;
                            s.error = Some(registry::GenerationError {
                                message: e.to_string(),
                                code: e.code().to_string(),
                            });
                        });
                        current_generation.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }

            registry.update(&id, |s| {
                s.status = Status::Complete;
                s.result = Some(registry::GenerationResult {
                    images,
                    format: std::mem::take(&mut format),
                    time_taken_ms: last_time_taken,
                });
            });
            current_generation.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilitySnapshot, CpuInfo, GpuInfo, GpuType, MemoryInfo};
    use crate::llm_collaborator::LlmServerManager;
    use async_trait::async_trait;

    struct FakeOracle;
    #[async_trait]
    impl CapabilityOracle for FakeOracle {
        async fn snapshot(&self) -> CapabilitySnapshot {
            CapabilitySnapshot {
                cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
                memory: MemoryInfo { total: 32 << 30, available: 16 << 30 },
                gpu: GpuInfo { available: false, gpu_type: GpuType::None, vram: None, vram_available: None },
            }
        }
        fn clear_cache(&self) {}
    }

    struct NoLlm;
    #[async_trait]
    impl LlmServerManager for NoLlm {
        async fn is_running(&self) -> bool {
            false
        }
        async fn get_config(&self) -> Option<crate::llm_collaborator::LlmConfig> {
            None
        }
        async fn start(&self, _config: crate::llm_collaborator::LlmConfig) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn server(tmp: &std::path::Path) -> DiffusionServer {
        let capability: Arc<dyn CapabilityOracle> = Arc::new(FakeOracle);
        let models = Arc::new(ModelManager::new(tmp.join("models")));
        let binaries = Arc::new(BinaryManager::new(tmp.join("bin"), capability.clone()));
        let orchestrator = Arc::new(Orchestrator::new(capability.clone(), Arc::new(NoLlm)));
        let ports = Arc::new(PortAllocator::new());
        let metrics = Arc::new(ObservabilityManager::new());
        DiffusionServer::new(models, binaries, capability, orchestrator, ports, metrics)
    }

    #[tokio::test]
    async fn starts_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let s = server(tmp.path());
        assert_eq!(s.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_from_stopped_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let s = server(tmp.path());
        s.stop().await.unwrap();
        assert_eq!(s.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn accept_generation_fails_when_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let s = server(tmp.path());
        let req = GenerationRequest {
            prompt: "a cat".into(),
            ..Default::default()
        };
        assert!(s.accept_generation(req).is_err());
    }

    #[tokio::test]
    async fn start_fails_for_unknown_model() {
        let tmp = tempfile::tempdir().unwrap();
        let s = server(tmp.path());
        let config = DiffusionConfig {
            model_id: "missing".into(),
            port: None,
            threads: None,
            gpu_layers: None,
            force_validation: false,
            clip_on_cpu: Default::default(),
            vae_on_cpu: Default::default(),
            batch_size: None,
            offload_to_cpu: Default::default(),
            diffusion_flash_attention: Default::default(),
        };
        let result = s.start(&config, Vec::new(), "auto").await;
        assert!(result.is_err());
        assert_eq!(s.state(), LifecycleState::Stopped);
    }
}
