//! External collaborator: the LLM server manager (§6.4). The core only ever
//! calls through this trait — it never proxies the LLM server's own HTTP API
//! or parses its config format (§1 Non-goals).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Opaque to the core beyond the fields it needs for the offload decision
/// (§4.4) — `total_layers` feeds the VRAM split estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model_id: String,
    pub port: u16,
    pub gpu_layers: u32,
    pub total_layers: Option<u32>,
    /// On-disk size of the loaded LLM model, used by the Resource
    /// Orchestrator's VRAM/RAM split estimate (§4.4). `None` degrades the
    /// split estimate's LLM-side contribution to 0, which only matters when
    /// the LLM's own footprint would itself threaten the offload threshold —
    /// documented as an acceptable source-of-truth gap at this boundary.
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait LlmServerManager: Send + Sync {
    async fn is_running(&self) -> bool;
    async fn get_config(&self) -> Option<LlmConfig>;
    async fn start(&self, config: LlmConfig) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// {config, wasRunning, savedAt} (§3) — written by the orchestrator when it
/// offloads the LLM, cleared on successful reload, retained on failure so the
/// UI can surface what was lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedLlmState {
    pub config: LlmConfig,
    pub was_running: bool,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Talks to an LLM server that is managed by a process outside this binary
/// (§6.4: the core never spawns or proxies it). Assumes the external manager
/// exposes a minimal control surface — `GET /control/health`, `GET
/// /control/config`, `POST /control/load`, `POST /control/unload` — which is
/// genforge's own contract, not the LLM server's inference API; no request
/// here ever touches completions/generation endpoints.
pub struct HttpLlmServerManager {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLlmServerManager {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LlmServerManager for HttpLlmServerManager {
    async fn is_running(&self) -> bool {
        self.client
            .get(format!("{}/control/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn get_config(&self) -> Option<LlmConfig> {
        let response = self
            .client
            .get(format!("{}/control/config", self.base_url))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<LlmConfig>().await.ok()
    }

    async fn start(&self, config: LlmConfig) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/control/load", self.base_url))
            .json(&config)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("LLM server load request failed: {}", response.status());
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/control/unload", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "LLM server unload request returned non-success");
        }
        Ok(())
    }
}

/// Fallback manager for when no external LLM control URL is configured — the
/// offload path simply never engages and every diffusion job runs no-offload.
#[derive(Debug, Default)]
pub struct NullLlmServerManager;

#[async_trait]
impl LlmServerManager for NullLlmServerManager {
    async fn is_running(&self) -> bool {
        false
    }
    async fn get_config(&self) -> Option<LlmConfig> {
        None
    }
    async fn start(&self, _config: LlmConfig) -> anyhow::Result<()> {
        Ok(())
    }
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
