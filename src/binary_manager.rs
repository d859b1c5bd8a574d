//! Binary Manager (§4.1): variant-priority download, GPU-capability filtering,
//! two-phase validation, validation-cache-keyed skip. Grounded on the
//! GitHub-release asset matching, streamed download, and archive extraction
//! idiom used for fetching inference-engine binaries.

use crate::archive;
use crate::capability::{CapabilityOracle, GpuType};
use crate::checksum::sha256_file;
use crate::downloader::{CancelHandle, Downloader};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Llama,
    Diffusion,
}

impl BackendKind {
    fn tag(&self) -> &'static str {
        match self {
            BackendKind::Llama => "llama",
            BackendKind::Diffusion => "diffusion",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub url: String,
    pub checksum: String,
}

/// One build flavor of a backend, e.g. "cuda", "vulkan", "cpu". Order in the
/// owning `Vec<Variant>` is priority — earlier entries are preferred (§4.1).
#[derive(Debug, Clone)]
pub struct Variant {
    pub tag: String,
    pub requires_cuda: bool,
    pub archive_url: String,
    pub archive_checksum: String,
    pub dependencies: Vec<Dependency>,
    /// Candidate binary file names to search for after extraction.
    pub binary_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCache {
    pub variant_tag: String,
    pub binary_sha256: String,
    pub validated_at: chrono::DateTime<chrono::Utc>,
    pub phase1_passed: bool,
    pub phase2_passed: Option<bool>,
}

/// A resolved binary plus which variant produced it — callers that synthesize
/// argv (e.g. `compute_vram_flags`'s CUDA-suppression rule, §4.3.3) need
/// `requires_cuda` to know whether the offload flag is safe to set.
#[derive(Debug, Clone)]
pub struct ResolvedBinary {
    pub path: PathBuf,
    pub requires_cuda: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantCache {
    pub variant: String,
    pub platform_key: String,
}

pub struct BinaryManager {
    binary_dir: PathBuf,
    downloader: Downloader,
    capability: Arc<dyn CapabilityOracle>,
}

impl BinaryManager {
    pub fn new(binary_dir: PathBuf, capability: Arc<dyn CapabilityOracle>) -> Self {
        Self {
            binary_dir,
            downloader: Downloader::new(),
            capability,
        }
    }

    fn binary_path(&self, backend: BackendKind) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{}.exe", backend.tag())
        } else {
            backend.tag().to_string()
        };
        self.binary_dir.join(backend.tag()).join(name)
    }

    fn validation_cache_path(&self, backend: BackendKind) -> PathBuf {
        self.binary_dir
            .join(backend.tag())
            .join(".validation.json")
    }

    fn variant_cache_path(&self, backend: BackendKind) -> PathBuf {
        self.binary_dir.join(backend.tag()).join(".variant.json")
    }

    async fn load_validation_cache(&self, backend: BackendKind) -> Option<ValidationCache> {
        let body = tokio::fs::read(self.validation_cache_path(backend))
            .await
            .ok()?;
        serde_json::from_slice(&body).ok()
    }

    async fn save_validation_cache(&self, backend: BackendKind, cache: &ValidationCache) -> Result<()> {
        let path = self.validation_cache_path(backend);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(cache)?).await?;
        Ok(())
    }

    async fn load_variant_cache(&self, backend: BackendKind) -> Option<VariantCache> {
        let body = tokio::fs::read(self.variant_cache_path(backend)).await.ok()?;
        serde_json::from_slice(&body).ok()
    }

    async fn save_variant_cache(&self, backend: BackendKind, cache: &VariantCache) -> Result<()> {
        let path = self.variant_cache_path(backend);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(cache)?).await?;
        Ok(())
    }

    /// Drops CUDA-only variants when the host has no CUDA GPU (§4.1 step 1).
    async fn filter_variants(&self, variants: Vec<Variant>) -> Result<Vec<Variant>> {
        let snapshot = self.capability.snapshot().await;
        let has_cuda = snapshot.gpu.available && snapshot.gpu.gpu_type == GpuType::Cuda;
        let filtered: Vec<Variant> = variants
            .into_iter()
            .filter(|v| !v.requires_cuda || has_cuda)
            .collect();
        if filtered.is_empty() {
            return Err(CoreError::BinaryError {
                message: "no variant compatible with this host's GPU capability".into(),
                details: None,
            });
        }
        Ok(filtered)
    }

    /// Reorders so the previously-installed variant (per VariantCache) is tried
    /// first (§4.1 step 3).
    fn reorder_with_hint(mut variants: Vec<Variant>, hint: Option<&VariantCache>) -> Vec<Variant> {
        if let Some(hint) = hint {
            if let Some(pos) = variants.iter().position(|v| v.tag == hint.variant) {
                let preferred = variants.remove(pos);
                variants.insert(0, preferred);
            }
        }
        variants
    }

    /// Runs the full BM algorithm (§4.1) and returns the resolved binary path.
    pub async fn resolve(
        &self,
        backend: BackendKind,
        variants: Vec<Variant>,
        test_model: Option<&Path>,
        platform_key: &str,
    ) -> Result<ResolvedBinary> {
        let target = self.binary_path(backend);

        // Cache-hit path (§4.1 step 2).
        if target.exists() {
            if let Some(cache) = self.load_validation_cache(backend).await {
                let actual = sha256_file(&target).await?;
                if actual.eq_ignore_ascii_case(&cache.binary_sha256) {
                    info!(backend = ?backend, variant = %cache.variant_tag, "binary cache hit, skipping revalidation");
                    let requires_cuda = variants
                        .iter()
                        .find(|v| v.tag == cache.variant_tag)
                        .map(|v| v.requires_cuda)
                        .unwrap_or(false);
                    return Ok(ResolvedBinary {
                        path: target,
                        requires_cuda,
                    });
                }
                warn!(backend = ?backend, "binary sha256 no longer matches cache, revalidating");
            }
        }

        let variants = self.filter_variants(variants).await?;
        let hint = self.load_variant_cache(backend).await;
        let variants = Self::reorder_with_hint(variants, hint.as_ref());

        let mut errors: Vec<String> = Vec::new();
        for variant in variants {
            match self
                .try_variant(backend, &variant, test_model, &target)
                .await
            {
                Ok(()) => {
                    self.save_variant_cache(
                        backend,
                        &VariantCache {
                            variant: variant.tag.clone(),
                            platform_key: platform_key.to_string(),
                        },
                    )
                    .await?;
                    return Ok(ResolvedBinary {
                        path: target,
                        requires_cuda: variant.requires_cuda,
                    });
                }
                Err(e) => {
                    warn!(variant = %variant.tag, error = %e, "variant attempt failed");
                    errors.push(format!("{}: {}", variant.tag, e));
                }
            }
        }

        Err(CoreError::BinaryError {
            message: "all variants failed".into(),
            details: Some(errors.join("; ")),
        })
    }

    async fn try_variant(
        &self,
        backend: BackendKind,
        variant: &Variant,
        test_model: Option<&Path>,
        target: &Path,
    ) -> Result<()> {
        let workdir = self.binary_dir.join(backend.tag());
        tokio::fs::create_dir_all(&workdir).await?;

        let archive_path = workdir.join(format!("{}.archive.tmp", variant.tag));
        let cancel = CancelHandle::new();
        self.downloader
            .download(&variant.archive_url, &archive_path, &cancel, |_, _| {})
            .await?;
        let archive_hash = sha256_file(&archive_path).await?;
        if !archive_hash.eq_ignore_ascii_case(&variant.archive_checksum) {
            tokio::fs::remove_file(&archive_path).await.ok();
            return Err(CoreError::ChecksumError {
                message: format!("archive checksum mismatch for variant '{}'", variant.tag),
            });
        }

        // Dependencies extracted before the main binary (§4.1: "dependencies
        // MUST be extracted before the main binary is tested, so DLLs are
        // co-located").
        for dep in &variant.dependencies {
            let dep_path = workdir.join(format!("{}.dep.tmp", variant.tag));
            self.downloader
                .download(&dep.url, &dep_path, &cancel, |_, _| {})
                .await?;
            let dep_hash = sha256_file(&dep_path).await?;
            if !dep_hash.eq_ignore_ascii_case(&dep.checksum) {
                tokio::fs::remove_file(&dep_path).await.ok();
                tokio::fs::remove_file(&archive_path).await.ok();
                return Err(CoreError::ChecksumError {
                    message: format!("dependency checksum mismatch for variant '{}'", variant.tag),
                });
            }
            archive::extract(&dep_path, &workdir).await?;
            tokio::fs::remove_file(&dep_path).await.ok();
        }

        archive::extract(&archive_path, &workdir).await?;
        tokio::fs::remove_file(&archive_path).await.ok();
        archive::mark_executable_dir(&workdir)?;

        let found_binary = variant
            .binary_names
            .iter()
            .find_map(|name| archive::find_binary(&workdir, name));
        let found_binary = found_binary.ok_or_else(|| CoreError::BinaryError {
            message: format!("no known binary name found after extracting variant '{}'", variant.tag),
            details: None,
        })?;

        if found_binary != target {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&found_binary, target).await?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = tokio::fs::metadata(target).await?;
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o755);
            tokio::fs::set_permissions(target, perms).await?;
        }

        self.validate(backend, target, test_model).await?;

        let binary_sha = sha256_file(target).await?;
        self.save_validation_cache(
            backend,
            &ValidationCache {
                variant_tag: variant.tag.clone(),
                binary_sha256: binary_sha,
                validated_at: chrono::Utc::now(),
                phase1_passed: true,
                phase2_passed: Some(test_model.is_some()),
            },
        )
        .await?;

        Ok(())
    }

    /// Reports the cached validation state for a backend, if any, without
    /// touching the network — used by `genforge binary status`.
    pub async fn status(&self, backend: BackendKind) -> Option<ValidationCache> {
        self.load_validation_cache(backend).await
    }

    /// Two-phase validation (§4.1). Phase 1 always runs; Phase 2 only when a
    /// test model is supplied.
    async fn validate(
        &self,
        backend: BackendKind,
        binary: &Path,
        test_model: Option<&Path>,
    ) -> Result<()> {
        let trivial_flag = match backend {
            BackendKind::Llama => "--version",
            BackendKind::Diffusion => "--help",
        };
        run_with_timeout(binary, &[trivial_flag], Duration::from_secs(5))
            .await
            .map_err(|e| CoreError::BinaryError {
                message: format!("phase 1 validation failed: {e}"),
                details: None,
            })?;

        if let Some(model) = test_model {
            let args: Vec<String> = match backend {
                BackendKind::Llama => vec![
                    "-m".into(),
                    model.display().to_string(),
                    "-ngl".into(),
                    "1".into(),
                    "-p".into(),
                    "What is 2+2?".into(),
                ],
                BackendKind::Diffusion => vec![
                    "-m".into(),
                    model.display().to_string(),
                    "-p".into(),
                    "test".into(),
                    "-W".into(),
                    "64".into(),
                    "-H".into(),
                    "64".into(),
                    "--steps".into(),
                    "1".into(),
                ],
            };
            let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            let output = run_with_timeout(binary, &args_ref, Duration::from_secs(15))
                .await
                .map_err(|e| CoreError::BinaryError {
                    message: format!("phase 2 validation failed: {e}"),
                    details: None,
                })?;

            if contains_failure_marker(&output) {
                return Err(CoreError::BinaryError {
                    message: "phase 2 validation detected a GPU/driver failure marker".into(),
                    details: Some(output),
                });
            }
        }
        Ok(())
    }
}

const FAILURE_MARKERS: &[&str] = &[
    "cuda error",
    "failed to allocate",
    "vulkan error",
    "out of memory",
    "failed to load model",
];

fn contains_failure_marker(output: &str) -> bool {
    let lower = output.to_lowercase();
    FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Spawns `binary` with `args`, stdin ignored, stdout+stderr piped, SIGTERMing
/// on timeout. Returns combined output regardless of exit status — callers
/// inspect it for failure markers even on exit 0 (§4.1 Validation).
async fn run_with_timeout(binary: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::BinaryError {
            message: format!("failed to spawn {}: {e}", binary.display()),
            details: None,
        })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| CoreError::BinaryError {
            message: e.to_string(),
            details: None,
        })?,
        Err(_) => {
            // hard timeout: kill the hung validation child rather than leaking
            // it as an orphan when this future is dropped (§4.1 process
            // execution contract).
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CoreError::BinaryError {
                message: format!("timed out after {:?}", timeout),
                details: None,
            });
        }
    };

    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&stdout_buf),
        String::from_utf8_lossy(&stderr_buf)
    );
    if status.success() {
        Ok(combined)
    } else {
        Err(CoreError::BinaryError {
            message: format!("exit code {:?}", status.code()),
            details: Some(combined),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(tag: &str, requires_cuda: bool) -> Variant {
        Variant {
            tag: tag.to_string(),
            requires_cuda,
            archive_url: format!("http://example.invalid/{tag}.zip"),
            archive_checksum: "deadbeef".into(),
            dependencies: vec![],
            binary_names: vec!["sd".into()],
        }
    }

    #[test]
    fn failure_marker_detection_is_case_insensitive() {
        assert!(contains_failure_marker("CUDA Error: out of memory"));
        assert!(contains_failure_marker("Failed to allocate buffer"));
        assert!(!contains_failure_marker("decode_first_stage completed"));
    }

    #[test]
    fn reorder_with_hint_moves_matching_variant_first() {
        let variants = vec![variant("cuda", true), variant("vulkan", false), variant("cpu", false)];
        let hint = VariantCache {
            variant: "vulkan".into(),
            platform_key: "linux-x64".into(),
        };
        let reordered = BinaryManager::reorder_with_hint(variants, Some(&hint));
        assert_eq!(reordered[0].tag, "vulkan");
    }

    #[test]
    fn reorder_without_hint_is_unchanged() {
        let variants = vec![variant("cuda", true), variant("vulkan", false)];
        let reordered = BinaryManager::reorder_with_hint(variants.clone(), None);
        assert_eq!(reordered[0].tag, variants[0].tag);
    }
}
