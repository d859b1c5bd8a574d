//! Model Manager — multi-component download path (§4.2) and the authoritative
//! `ModelInfo` record (§3).

use crate::checksum::sha256_file;
use crate::downloader::{CancelHandle, Downloader};
use crate::error::{CoreError, Result};
use crate::huggingface;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Component role vocabulary (§3). Order is a protocol invariant: CLI flags for
/// the diffusion child (§4.3.3) and multi-component persistence both iterate
/// this exact order.
pub const ROLE_ORDER: &[&str] = &[
    "diffusion_model",
    "llm",
    "vae",
    "clip_l",
    "clip_g",
    "t5",
    "controlnet",
    "lora",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Llm,
    Diffusion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Provenance {
    Url { url: String },
    Repo { repo: String, file: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub kind: ModelKind,
    /// Path to the primary file — for multi-component models this is always the
    /// `diffusion_model` component's path.
    pub path: PathBuf,
    pub components: HashMap<String, ComponentRecord>,
    pub size: u64,
    pub provenance: Provenance,
    pub expected_checksum: Option<String>,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
    /// Opaque to the core — e.g. architecture, layer count, context length.
    pub metadata: Option<serde_json::Value>,
}

impl ModelInfo {
    /// Total layer count if metadata carries one. Used by the Resource
    /// Orchestrator's VRAM split estimate (§4.4, §9 open question #2) — falls
    /// back to the historical constant 32 only when metadata is absent.
    pub fn total_layers(&self) -> Option<u32> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("layer_count"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    }

    fn metadata_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(format!("{}.json", sanitize(&self.id)))
    }

    pub async fn persist(&self, models_dir: &Path) -> Result<()> {
        let path = self.metadata_path(models_dir);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// One component to fetch, in declared order (§4.2's "Request shape").
#[derive(Debug, Clone)]
pub struct ComponentRequest {
    pub role: String,
    pub source: FileSource,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FileSource {
    Url(String),
    Hf { repo: String, file: String },
}

impl FileSource {
    fn url(&self) -> String {
        match self {
            FileSource::Url(u) => u.clone(),
            FileSource::Hf { repo, file } => huggingface::resolve_url(repo, file),
        }
    }

    fn file_name(&self) -> String {
        match self {
            FileSource::Url(u) => u
                .rsplit('/')
                .next()
                .unwrap_or("download.bin")
                .to_string(),
            FileSource::Hf { file, .. } => file
                .rsplit('/')
                .next()
                .unwrap_or("download.bin")
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: ModelKind,
    pub primary: ComponentRequest,
    pub components: Vec<ComponentRequest>,
    pub model_directory: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type ComponentStartCallback = Arc<dyn Fn(&str) + Send + Sync>;

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
            c
        } else {
            '_'
        })
        .collect()
}

pub struct ModelManager {
    models_dir: PathBuf,
    downloader: Downloader,
}

impl ModelManager {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            downloader: Downloader::new(),
        }
    }

    pub fn model_metadata_path(&self, id: &str) -> PathBuf {
        self.models_dir.join(format!("{}.json", sanitize(id)))
    }

    pub async fn load(&self, id: &str) -> Result<ModelInfo> {
        let path = self.model_metadata_path(id);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|_| CoreError::model_not_found(id))?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn exists(&self, id: &str) -> bool {
        self.model_metadata_path(id).exists()
    }

    /// Lists every model with a persisted metadata file. Used by `genforge
    /// models list`; corrupt or unreadable metadata files are skipped rather
    /// than failing the whole listing.
    pub async fn list(&self) -> Result<Vec<ModelInfo>> {
        let mut infos = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(body) = tokio::fs::read(&path).await {
                if let Ok(info) = serde_json::from_slice::<ModelInfo>(&body) {
                    infos.push(info);
                }
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    /// Deletes a model's metadata and component files (§3: models are
    /// uninstalled by removing their persisted record and on-disk components).
    pub async fn remove(&self, id: &str) -> Result<()> {
        let info = self.load(id).await?;
        for component in info.components.values() {
            tokio::fs::remove_file(&component.path).await.ok();
        }
        if let Some(parent) = info.path.parent() {
            tokio::fs::remove_dir(parent).await.ok();
        }
        tokio::fs::remove_file(self.model_metadata_path(id)).await?;
        Ok(())
    }

    /// Implements §4.2's algorithm: idempotency guard, best-effort HEAD
    /// pre-fetch, sequential download with skip-on-match, all-or-nothing
    /// cleanup on failure.
    pub async fn download(
        &self,
        descriptor: DownloadDescriptor,
        on_progress: ProgressCallback,
        on_component_start: ComponentStartCallback,
    ) -> Result<ModelInfo> {
        if descriptor.components.iter().any(|c| c.role == "diffusion_model") {
            return Err(CoreError::FileSystemError {
                message: "role 'diffusion_model' is reserved for the primary file".into(),
            });
        }
        if self.exists(&descriptor.id) {
            return Err(CoreError::FileSystemError {
                message: format!("model '{}' already exists", descriptor.id),
            });
        }

        let dir_name = sanitize(
            descriptor
                .model_directory
                .as_deref()
                .unwrap_or(&descriptor.id),
        );
        let model_dir = self.models_dir.join(dir_name);
        tokio::fs::create_dir_all(&model_dir).await?;

        // Ordered (role, request, target_path) for primary + components.
        let mut files: Vec<(String, ComponentRequest, PathBuf)> = Vec::new();
        files.push((
            "diffusion_model".to_string(),
            descriptor.primary.clone(),
            model_dir.join(descriptor.primary.source.file_name()),
        ));
        for c in &descriptor.components {
            let target = model_dir.join(c.source.file_name());
            files.push((c.role.clone(), c.clone(), target));
        }

        // HEAD pre-fetch — best-effort, never fatal (§4.2 step 2).
        let mut total_bytes: u64 = 0;
        let mut known_sizes: HashMap<String, u64> = HashMap::new();
        for (role, req, target) in &files {
            if target.exists() {
                continue;
            }
            match self.downloader.head_content_length(&req.source.url()).await {
                Some(size) => {
                    known_sizes.insert(role.clone(), size);
                    total_bytes += size;
                }
                None => warn!(role = %role, "HEAD pre-fetch failed, contributing 0 to total"),
            }
        }

        let mut completed_bytes: u64 = 0;
        let mut components: HashMap<String, ComponentRecord> = HashMap::new();
        let mut success_list: Vec<PathBuf> = Vec::new();
        let mut primary_path: Option<PathBuf> = None;

        for (role, req, target) in files {
            on_component_start(&role);

            if target.exists() {
                if let Some(expected) = &req.checksum {
                    let actual = sha256_file(&target).await?;
                    if actual.eq_ignore_ascii_case(expected) {
                        let size = tokio::fs::metadata(&target).await?.len();
                        completed_bytes += size;
                        components.insert(
                            role.clone(),
                            ComponentRecord {
                                path: target.clone(),
                                size,
                                checksum: Some(actual),
                            },
                        );
                        if role == "diffusion_model" {
                            primary_path = Some(target.clone());
                        }
                        on_progress(completed_bytes, total_bytes);
                        continue;
                    } else {
                        tokio::fs::remove_file(&target).await.ok();
                    }
                } else {
                    let size = tokio::fs::metadata(&target).await?.len();
                    completed_bytes += size;
                    components.insert(
                        role.clone(),
                        ComponentRecord {
                            path: target.clone(),
                            size,
                            checksum: None,
                        },
                    );
                    if role == "diffusion_model" {
                        primary_path = Some(target.clone());
                    }
                    on_progress(completed_bytes, total_bytes);
                    continue;
                }
            }

            let base = completed_bytes;
            let progress_cb = on_progress.clone();
            let result = self
                .downloader
                .download(&req.source.url(), &target, &CancelHandle::new(), |done, _| {
                    progress_cb(base + done, total_bytes);
                })
                .await;

            if let Err(e) = result {
                self.cleanup(&model_dir, &success_list).await;
                return Err(e);
            }

            if let Some(expected) = &req.checksum {
                let actual = sha256_file(&target).await?;
                if !actual.eq_ignore_ascii_case(expected) {
                    self.cleanup(&model_dir, &success_list).await;
                    return Err(CoreError::ChecksumError {
                        message: format!("component '{role}' checksum mismatch"),
                    });
                }
            }

            let size = tokio::fs::metadata(&target).await?.len();
            completed_bytes += size;
            success_list.push(target.clone());
            components.insert(
                role.clone(),
                ComponentRecord {
                    path: target.clone(),
                    size,
                    checksum: req.checksum.clone(),
                },
            );
            if role == "diffusion_model" {
                primary_path = Some(target.clone());
            }
            on_progress(completed_bytes, total_bytes);
        }

        let primary_path = primary_path.ok_or_else(|| CoreError::FileSystemError {
            message: "primary file missing after download loop".into(),
        })?;

        // GGUF metadata fetch is non-fatal for multi-component models (§4.2 step 5).
        let metadata = if primary_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("gguf"))
            .unwrap_or(false)
        {
            read_gguf_metadata_best_effort(&primary_path).await
        } else {
            None
        };

        let info = ModelInfo {
            id: descriptor.id,
            display_name: descriptor.display_name,
            kind: descriptor.kind,
            path: primary_path,
            size: components.values().map(|c| c.size).sum(),
            components,
            provenance: match &descriptor.primary.source {
                FileSource::Url(u) => Provenance::Url { url: u.clone() },
                FileSource::Hf { repo, file } => Provenance::Repo {
                    repo: repo.clone(),
                    file: file.clone(),
                },
            },
            expected_checksum: descriptor.primary.checksum,
            downloaded_at: chrono::Utc::now(),
            metadata,
        };

        info.persist(&self.models_dir).await?;
        info!(id = %info.id, size = info.size, "model download complete");
        Ok(info)
    }

    /// §4.2's cleanup: only files this invocation downloaded are deleted; the
    /// directory is removed only if doing so leaves it empty, since a peer
    /// variant may share component files.
    async fn cleanup(&self, model_dir: &Path, success_list: &[PathBuf]) {
        for path in success_list {
            tokio::fs::remove_file(path).await.ok();
        }
        tokio::fs::remove_dir(model_dir).await.ok();
    }
}

/// Placeholder metadata reader — GGUF header parsing is an external collaborator
/// per §1 ("GGUF metadata parsing details" is out of scope). Failure is
/// swallowed per §4.2 step 5.
async fn read_gguf_metadata_best_effort(_path: &Path) -> Option<serde_json::Value> {
    None
}
