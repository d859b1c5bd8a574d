//! Per-job execution pipeline (§4.3.3): VRAM flag computation, argument
//! synthesis, process spawn. Stdout/stderr reader shape and the
//! `\r`/`\n`-split line reassembly are ported from the donor's `run_local_sd`
//! (stable-diffusion.cpp overwrites progress with `\r`, so `BufReader::lines`
//! alone would never yield a complete line).

use crate::capability::CapabilitySnapshot;
use crate::config::{DiffusionConfig, TriState};
use crate::diffusion::progress::{ProgressTracker, TimeEstimator};
use crate::diffusion::registry::{GeneratedImage, Stage};
use crate::error::{CoreError, Result};
use crate::model_manager::{ModelInfo, ROLE_ORDER};
use base64::Engine as _;
use rand::Rng;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

const FOOTPRINT_OVERHEAD_FACTOR: f64 = 1.2;
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const STDERR_RING_SIZE: usize = 20;

/// Role-specific CLI flag for each component (§4.3.3 argument synthesis).
fn role_flag(role: &str) -> Option<&'static str> {
    match role {
        "diffusion_model" => Some("-m"),
        "llm" => Some("--text-encoder"),
        "vae" => Some("--vae"),
        "clip_l" => Some("--clip_l"),
        "clip_g" => Some("--clip_g"),
        "t5" => Some("--t5xxl"),
        "controlnet" => Some("--control-net"),
        "lora" => None, // lora paths are embedded in the prompt via <lora:...>, not a flag
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    Euler,
    EulerA,
    Heun,
    Dpm2,
    DpmPlusPlus2sA,
    DpmPlusPlus2m,
    DpmPlusPlus2mv2,
    Lcm,
}

impl Sampler {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "euler" => Sampler::Euler,
            "euler_a" => Sampler::EulerA,
            "heun" => Sampler::Heun,
            "dpm2" => Sampler::Dpm2,
            "dpm++2s_a" => Sampler::DpmPlusPlus2sA,
            "dpm++2m" => Sampler::DpmPlusPlus2m,
            "dpm++2mv2" => Sampler::DpmPlusPlus2mv2,
            "lcm" => Sampler::Lcm,
            _ => return None,
        })
    }

    fn cli_value(self) -> &'static str {
        match self {
            Sampler::Euler => "euler",
            Sampler::EulerA => "euler_a",
            Sampler::Heun => "heun",
            Sampler::Dpm2 => "dpm2",
            Sampler::DpmPlusPlus2sA => "dpm++2s_a",
            Sampler::DpmPlusPlus2m => "dpm++2m",
            Sampler::DpmPlusPlus2mv2 => "dpm++2mv2",
            Sampler::Lcm => "lcm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub seed: i64,
    pub sampler: Sampler,
    pub count: u32,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.5,
            seed: -1,
            sampler: Sampler::EulerA,
            count: 1,
        }
    }
}

/// Deterministic result of §4.3.3's flag-computation table, resolved with
/// user overrides winning.
#[derive(Debug, Clone, Copy, Default)]
pub struct VramFlags {
    pub clip_on_cpu: bool,
    pub vae_on_cpu: bool,
    pub offload_to_cpu: bool,
    pub diffusion_flash_attention: bool,
}

/// Computes the VRAM flag set fresh per job (§4.3.3). `variant_requires_cuda`
/// is needed because `offload_to_cpu` is suppressed on CUDA builds (they
/// crash with this flag per §4.3.3's note).
pub fn compute_vram_flags(
    model: &ModelInfo,
    snapshot: &CapabilitySnapshot,
    config: &DiffusionConfig,
    variant_requires_cuda: bool,
) -> VramFlags {
    let footprint = model.size as f64 * FOOTPRINT_OVERHEAD_FACTOR;

    let mut clip_on_cpu = false;
    let mut vae_on_cpu = false;
    let mut offload_to_cpu = false;
    let diffusion_flash_attention = model.components.contains_key("llm");

    match (snapshot.gpu.available, snapshot.gpu.vram) {
        (false, _) | (_, None) => {
            clip_on_cpu = true;
            vae_on_cpu = false;
        }
        (true, Some(vram_total)) => {
            let headroom_gib = (vram_total as f64 - footprint) / (1024.0 * 1024.0 * 1024.0);
            if headroom_gib < 6.0 {
                clip_on_cpu = true;
            }
            if headroom_gib < 2.0 {
                vae_on_cpu = true;
            }
            if footprint > vram_total as f64 * 0.85 && !variant_requires_cuda {
                offload_to_cpu = true;
            }
            if let Some(vram_available) = snapshot.gpu.vram_available {
                let remaining_gib =
                    (vram_available as f64 - footprint) / (1024.0 * 1024.0 * 1024.0);
                if remaining_gib < 2.0 {
                    clip_on_cpu = true;
                }
            }
        }
    }

    VramFlags {
        clip_on_cpu: config.clip_on_cpu.resolve(clip_on_cpu),
        vae_on_cpu: config.vae_on_cpu.resolve(vae_on_cpu),
        offload_to_cpu: config.offload_to_cpu.resolve(offload_to_cpu),
        diffusion_flash_attention: config
            .diffusion_flash_attention
            .resolve(diffusion_flash_attention),
    }
}

/// Generates a uniform 31-bit non-negative seed (§4.3.3 "Seed normalization").
pub fn normalize_seed(requested: i64) -> i64 {
    if requested < 0 {
        rand::thread_rng().gen_range(0..(1i64 << 31))
    } else {
        requested
    }
}

/// Cooperative cancellation — SIGTERM with a grace period, matching §5's
/// cancellation contract, not a hard kill on first ask.
#[derive(Clone)]
pub struct JobCancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobCancelHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct JobOutcome {
    pub image: GeneratedImage,
    pub time_taken_ms: u64,
    pub measured: crate::diffusion::progress::MeasuredStages,
    pub megapixels: f64,
}

/// Builds the child's argv in component order, then the generation
/// parameters, then optimization flags, then the output path (§4.3.3). Binary
/// path is prepended by the caller (`Command::new`).
pub fn build_args(
    model: &ModelInfo,
    req: &GenerationRequest,
    flags: &VramFlags,
    threads: Option<u32>,
    seed: i64,
    out_path: &std::path::Path,
) -> Vec<String> {
    let mut args = Vec::new();

    for role in ROLE_ORDER {
        if *role == "diffusion_model" {
            args.push("-m".into());
            args.push(model.path.to_string_lossy().into_owned());
            continue;
        }
        if let Some(component) = model.components.get(*role) {
            if let Some(flag) = role_flag(role) {
                args.push(flag.into());
                args.push(component.path.to_string_lossy().into_owned());
            }
        }
    }

    args.push("-p".into());
    args.push(req.prompt.clone());
    if let Some(neg) = &req.negative_prompt {
        if !neg.trim().is_empty() {
            args.push("-n".into());
            args.push(neg.clone());
        }
    }
    args.push("-W".into());
    args.push(req.width.to_string());
    args.push("-H".into());
    args.push(req.height.to_string());
    args.push("--steps".into());
    args.push(req.steps.to_string());
    args.push("--cfg-scale".into());
    args.push(format!("{:.1}", req.cfg_scale));
    args.push("-s".into());
    args.push(seed.to_string());
    args.push("--sampling-method".into());
    args.push(req.sampler.cli_value().into());

    if let Some(t) = threads {
        if t > 0 {
            args.push("-t".into());
            args.push(t.to_string());
        }
    }

    if flags.clip_on_cpu {
        args.push("--clip-on-cpu".into());
    }
    if flags.vae_on_cpu {
        args.push("--vae-on-cpu".into());
    }
    if flags.offload_to_cpu {
        args.push("--offload-to-cpu".into());
    }
    if flags.diffusion_flash_attention {
        args.push("--diffusion-fa".into());
    }

    args.push("-o".into());
    args.push(out_path.to_string_lossy().into_owned());

    args
}

/// Reads a child's stream byte-by-byte, splitting on both `\r` and `\n` (the
/// donor's overwrite-aware line reassembly), calling `on_line` for each
/// completed line and collecting every line for the stderr tail.
async fn drain_stream<R, F>(mut reader: R, mut on_line: F) -> Vec<String>
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut raw = Vec::<u8>::with_capacity(256);
    let mut tmp = [0u8; 256];
    let mut collected = Vec::new();
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for &b in &tmp[..n] {
                    if b == b'\n' || b == b'\r' {
                        if !raw.is_empty() {
                            let line = String::from_utf8_lossy(&raw).into_owned();
                            on_line(&line);
                            collected.push(line);
                            raw.clear();
                        }
                    } else {
                        raw.push(b);
                    }
                }
            }
        }
    }
    if !raw.is_empty() {
        let line = String::from_utf8_lossy(&raw).into_owned();
        on_line(&line);
        collected.push(line);
    }
    collected
}

/// Runs one sub-generation: spawns the child, drives the progress tracker
/// from stdout, keeps a bounded stderr tail, waits for exit, reads back the
/// output file (§4.3.3's process orchestration).
pub async fn run_generation(
    binary: &PathBuf,
    model: &ModelInfo,
    req: &GenerationRequest,
    flags: &VramFlags,
    threads: Option<u32>,
    seed: i64,
    estimator: &TimeEstimator,
    cancel: JobCancelHandle,
    mut on_progress: impl FnMut(&ProgressUpdateOwned) + Send + 'static,
) -> Result<JobOutcome> {
    let started = Instant::now();
    let out_path = std::env::temp_dir().join(format!(
        "genforge_sd_{}.png",
        uuid::Uuid::new_v4().simple()
    ));

    let args = build_args(model, req, flags, threads, seed, &out_path);
    info!(?args, binary = %binary.display(), "spawning diffusion child");

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| CoreError::BinaryError {
        message: format!("failed to spawn diffusion binary: {e}"),
        details: Some(format!("{binary:?} {args:?}")),
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let tracker = Arc::new(parking_lot::Mutex::new(ProgressTracker::new(
        estimator,
        req.steps,
        req.width,
        req.height,
    )));

    let stdout_tracker = tracker.clone();
    let stdout_task: tokio::task::JoinHandle<Vec<String>> = tokio::spawn(async move {
        drain_stream(stdout, move |line| {
            if let Some(update) = stdout_tracker.lock().on_line(line) {
                on_progress(&ProgressUpdateOwned {
                    current_step: update.current_step,
                    total_steps: update.total_steps,
                    stage: update.stage,
                    percentage: update.percentage,
                });
            }
        })
        .await
    });

    let stderr_task: tokio::task::JoinHandle<Vec<String>> =
        tokio::spawn(async move { drain_stream(stderr, |_| {}).await });

    let pid = child.id();
    let watch_cancel = cancel.clone();
    let cancel_task = tokio::spawn({
        let pid = pid;
        async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if watch_cancel.is_cancelled() {
                    if let Some(pid) = pid {
                        send_sigterm(pid);
                    }
                    break;
                }
            }
        }
    });

    let wait_result = tokio::select! {
        status = child.wait() => status,
        _ = async {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
        } => {
            if let Some(pid) = pid {
                send_sigterm(pid);
            }
            tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep(SIGTERM_GRACE) => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };
    cancel_task.abort();

    let status = wait_result.map_err(|e| CoreError::BinaryError {
        message: format!("failed to wait on diffusion child: {e}"),
        details: None,
    })?;

    let stdout_lines = stdout_task.await.unwrap_or_default();
    let stderr_lines = stderr_task.await.unwrap_or_default();

    if cancel.is_cancelled() {
        return Err(CoreError::ServerError {
            message: "cancelled".into(),
        });
    }

    if !status.success() {
        let mut tail: Vec<&str> = stderr_lines
            .iter()
            .chain(stdout_lines.iter())
            .rev()
            .take(STDERR_RING_SIZE)
            .map(|s| s.as_str())
            .collect();
        tail.reverse();
        return Err(CoreError::BinaryError {
            message: format!(
                "diffusion process exited with code {:?}",
                status.code()
            ),
            details: Some(format!("argv: {:?}\noutput tail:\n{}", args, tail.join("\n"))),
        });
    }

    let bytes = tokio::fs::read(&out_path).await.map_err(|e| CoreError::FileSystemError {
        message: format!("diffusion process exited 0 but output file missing: {e}"),
    })?;
    let _ = tokio::fs::remove_file(&out_path).await;

    let measured = tracker.lock().measured_stages();
    let megapixels = tracker.lock().megapixels();

    Ok(JobOutcome {
        image: GeneratedImage {
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            seed,
            width: req.width,
            height: req.height,
        },
        time_taken_ms: started.elapsed().as_millis() as u64,
        measured,
        megapixels,
    })
}

pub struct ProgressUpdateOwned {
    pub current_step: u32,
    pub total_steps: u32,
    pub stage: Stage,
    pub percentage: f32,
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {
    // no portable SIGTERM equivalent; rely on the SIGKILL grace-period fallback
}

/// §4.3.5 batch generation: `count` sequential sub-generations, seed
/// incremented per image when the caller supplied one, outer progress
/// composed as `(completed + current_pct) / count`.
pub fn batch_seed(base_seed: i64, index: u32, user_supplied: bool) -> i64 {
    if user_supplied {
        base_seed + index as i64
    } else {
        normalize_seed(-1)
    }
}

pub fn compose_batch_percentage(completed: u32, current_pct: f32, count: u32) -> f32 {
    if count == 0 {
        return 0.0;
    }
    ((completed as f32 + current_pct / 100.0) / count as f32 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CpuInfo, GpuInfo, GpuType, MemoryInfo};
    use crate::model_manager::{ComponentRecord, ModelKind, Provenance};
    use std::collections::HashMap;

    fn model_with_components(size: u64, components: &[&str]) -> ModelInfo {
        let mut map = HashMap::new();
        for c in components {
            map.insert(
                c.to_string(),
                ComponentRecord {
                    path: PathBuf::from(format!("/models/{c}.gguf")),
                    size: 1,
                    checksum: None,
                },
            );
        }
        ModelInfo {
            id: "m".into(),
            display_name: "m".into(),
            kind: ModelKind::Diffusion,
            path: PathBuf::from("/models/main.gguf"),
            components: map,
            size,
            provenance: Provenance::Url { url: "x".into() },
            expected_checksum: None,
            downloaded_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    fn config() -> DiffusionConfig {
        DiffusionConfig {
            model_id: "m".into(),
            port: None,
            threads: None,
            gpu_layers: None,
            force_validation: false,
            clip_on_cpu: TriState::Unset,
            vae_on_cpu: TriState::Unset,
            batch_size: None,
            offload_to_cpu: TriState::Unset,
            diffusion_flash_attention: TriState::Unset,
        }
    }

    #[test]
    fn no_gpu_forces_clip_on_cpu() {
        let model = model_with_components(1_000_000_000, &[]);
        let snapshot = CapabilitySnapshot {
            cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
            memory: MemoryInfo { total: 16 << 30, available: 8 << 30 },
            gpu: GpuInfo { available: false, gpu_type: GpuType::None, vram: None, vram_available: None },
        };
        let flags = compute_vram_flags(&model, &snapshot, &config(), false);
        assert!(flags.clip_on_cpu);
        assert!(!flags.vae_on_cpu);
    }

    #[test]
    fn tight_headroom_forces_vae_on_cpu() {
        let model = model_with_components(5 * (1u64 << 30), &[]);
        let snapshot = CapabilitySnapshot {
            cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
            memory: MemoryInfo { total: 16 << 30, available: 8 << 30 },
            gpu: GpuInfo {
                available: true,
                gpu_type: GpuType::Cuda,
                vram: Some(7 * (1u64 << 30)),
                vram_available: Some(7 * (1u64 << 30)),
            },
        };
        let flags = compute_vram_flags(&model, &snapshot, &config(), true);
        assert!(flags.clip_on_cpu);
        assert!(flags.vae_on_cpu);
    }

    #[test]
    fn user_override_wins_over_computed_default() {
        let model = model_with_components(1_000_000_000, &[]);
        let snapshot = CapabilitySnapshot {
            cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
            memory: MemoryInfo { total: 16 << 30, available: 8 << 30 },
            gpu: GpuInfo { available: false, gpu_type: GpuType::None, vram: None, vram_available: None },
        };
        let mut cfg = config();
        cfg.clip_on_cpu = TriState::False;
        let flags = compute_vram_flags(&model, &snapshot, &cfg, false);
        assert!(!flags.clip_on_cpu);
    }

    #[test]
    fn llm_component_enables_flash_attention_default() {
        let model = model_with_components(1_000_000_000, &["llm"]);
        let snapshot = CapabilitySnapshot {
            cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
            memory: MemoryInfo { total: 16 << 30, available: 8 << 30 },
            gpu: GpuInfo {
                available: true,
                gpu_type: GpuType::Cuda,
                vram: Some(24 * (1u64 << 30)),
                vram_available: Some(24 * (1u64 << 30)),
            },
        };
        let flags = compute_vram_flags(&model, &snapshot, &config(), true);
        assert!(flags.diffusion_flash_attention);
    }

    #[test]
    fn offload_to_cpu_suppressed_on_cuda() {
        let model = model_with_components(9 * (1u64 << 30), &[]);
        let snapshot = CapabilitySnapshot {
            cpu: CpuInfo { cores: 4, arch: "x86_64".into() },
            memory: MemoryInfo { total: 16 << 30, available: 8 << 30 },
            gpu: GpuInfo {
                available: true,
                gpu_type: GpuType::Cuda,
                vram: Some(10 * (1u64 << 30)),
                vram_available: Some(10 * (1u64 << 30)),
            },
        };
        let flags = compute_vram_flags(&model, &snapshot, &config(), true);
        assert!(!flags.offload_to_cpu);
    }

    #[test]
    fn build_args_orders_components_then_params_then_output() {
        let model = model_with_components(1, &["vae", "clip_l"]);
        let req = GenerationRequest {
            prompt: "a cat".into(),
            ..Default::default()
        };
        let flags = VramFlags::default();
        let args = build_args(&model, &req, &flags, None, 42, &PathBuf::from("/tmp/out.png"));
        assert_eq!(args[0], "-m");
        assert!(args.iter().any(|a| a == "--vae"));
        assert!(args.iter().any(|a| a == "--clip_l"));
        assert_eq!(args.last().unwrap(), "/tmp/out.png");
    }

    #[test]
    fn seed_normalization_leaves_non_negative_seed_untouched() {
        assert_eq!(normalize_seed(42), 42);
    }

    #[test]
    fn seed_normalization_generates_non_negative_for_negative_input() {
        let seed = normalize_seed(-1);
        assert!(seed >= 0);
        assert!(seed < (1i64 << 31));
    }

    #[test]
    fn batch_seed_increments_when_user_supplied() {
        assert_eq!(batch_seed(10, 0, true), 10);
        assert_eq!(batch_seed(10, 3, true), 13);
    }

    #[test]
    fn compose_batch_percentage_scales_by_count() {
        assert_eq!(compose_batch_percentage(0, 50.0, 2), 25.0);
        assert_eq!(compose_batch_percentage(1, 100.0, 2), 100.0);
    }
}
