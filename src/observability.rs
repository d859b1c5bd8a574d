//! Ambient observability: tracing-subscriber init plus a lightweight metrics
//! counter, structured the way the donor's `observability/mod.rs` shapes its
//! `SystemMetrics`/`ObservabilityManager`. Resource figures use `sysinfo`
//! directly (capability.rs already depends on it) rather than the donor's
//! hard-coded placeholder constants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Initializes the global tracing subscriber. Called once from `main` before
/// any other subsystem starts. `use_ansi` is decided by the caller from
/// `NO_COLOR`/TTY/`TERM` so redirected output and CI logs stay plain text.
pub fn init_tracing(use_ansi: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(use_ansi)
        .init();
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub health_check_interval: Duration,
    pub export_format: ExportFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            export_format: ExportFormat::Prometheus,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExportFormat {
    Prometheus,
    Json,
    Human,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_generations: u64,
    pub successful_generations: u64,
    pub failed_generations: u64,
    pub average_generation_time_ms: f64,

    pub model_stats: HashMap<String, ModelMetrics>,

    pub memory_usage_mb: f64,
    pub memory_total_mb: f64,
    pub cpu_usage_percent: f64,

    pub uptime_seconds: u64,
    pub last_updated: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub generations: u64,
    pub errors: u64,
    pub total_time_ms: f64,
    pub popularity_score: f64,
}

/// Tracks accumulated generation metrics for the diffusion server and the
/// binary/model download paths. Separate from `diffusion::registry` (which
/// tracks individual in-flight jobs with a TTL) — this is a long-lived
/// rolling counter for the process lifetime.
pub struct ObservabilityManager {
    metrics: Arc<RwLock<SystemMetrics>>,
    config: ObservabilityConfig,
    started_at: SystemTime,
}

impl Default for ObservabilityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilityManager {
    pub fn new() -> Self {
        Self::with_config(ObservabilityConfig::default())
    }

    pub fn with_config(config: ObservabilityConfig) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(SystemMetrics::default())),
            config,
            started_at: SystemTime::now(),
        }
    }

    /// Records one completed (or failed) generation job against a model id.
    pub async fn record_generation(&self, model_id: &str, elapsed: Duration, success: bool) {
        let mut metrics = self.metrics.write().await;

        metrics.total_generations += 1;
        if success {
            metrics.successful_generations += 1;
        } else {
            metrics.failed_generations += 1;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        metrics.average_generation_time_ms = (metrics.average_generation_time_ms
            * (metrics.total_generations - 1) as f64
            + elapsed_ms)
            / metrics.total_generations as f64;

        let uptime_hours = metrics.uptime_seconds.max(1) as f64 / 3600.0;
        let model_metrics = metrics
            .model_stats
            .entry(model_id.to_string())
            .or_insert_with(ModelMetrics::default);
        model_metrics.generations += 1;
        model_metrics.total_time_ms += elapsed_ms;
        if !success {
            model_metrics.errors += 1;
        }
        model_metrics.popularity_score = model_metrics.generations as f64 / uptime_hours;

        metrics.last_updated = now_unix();

        debug!(
            model_id,
            elapsed_ms, success, "recorded generation metrics"
        );
    }

    /// Refreshes the host resource gauges via `sysinfo` and bumps uptime.
    pub async fn update_system_metrics(&self) {
        let (memory_used, memory_total, cpu_percent) =
            tokio::task::spawn_blocking(Self::sample_host)
                .await
                .unwrap_or((0.0, 0.0, 0.0));

        let mut metrics = self.metrics.write().await;
        metrics.memory_usage_mb = memory_used;
        metrics.memory_total_mb = memory_total;
        metrics.cpu_usage_percent = cpu_percent;
        metrics.uptime_seconds = self
            .started_at
            .elapsed()
            .unwrap_or_default()
            .as_secs();
        metrics.last_updated = now_unix();
    }

    fn sample_host() -> (f64, f64, f64) {
        let mut sys = System::new_all();
        sys.refresh_all();
        let used_mb = (sys.total_memory() - sys.available_memory()) as f64 / (1024.0 * 1024.0);
        let total_mb = sys.total_memory() as f64 / (1024.0 * 1024.0);
        let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;
        (used_mb, total_mb, cpu_percent)
    }

    pub async fn export_metrics(&self) -> String {
        let metrics = self.metrics.read().await;
        match self.config.export_format {
            ExportFormat::Prometheus => Self::export_prometheus(&metrics),
            ExportFormat::Json => serde_json::to_string_pretty(&*metrics).unwrap_or_default(),
            ExportFormat::Human => Self::export_human_readable(&metrics),
        }
    }

    fn export_prometheus(metrics: &SystemMetrics) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "genforge_generations_total {}\n",
            metrics.total_generations
        ));
        out.push_str(&format!(
            "genforge_generations_successful {}\n",
            metrics.successful_generations
        ));
        out.push_str(&format!(
            "genforge_generations_failed {}\n",
            metrics.failed_generations
        ));
        out.push_str(&format!(
            "genforge_generation_time_avg_ms {}\n",
            metrics.average_generation_time_ms
        ));
        out.push_str(&format!(
            "genforge_memory_usage_mb {}\n",
            metrics.memory_usage_mb
        ));
        out.push_str(&format!(
            "genforge_cpu_usage_percent {}\n",
            metrics.cpu_usage_percent
        ));
        out.push_str(&format!("genforge_uptime_seconds {}\n", metrics.uptime_seconds));

        for (model, stats) in &metrics.model_stats {
            out.push_str(&format!(
                "genforge_model_generations{{model=\"{}\"}} {}\n",
                model, stats.generations
            ));
            out.push_str(&format!(
                "genforge_model_errors{{model=\"{}\"}} {}\n",
                model, stats.errors
            ));
        }
        out
    }

    fn export_human_readable(metrics: &SystemMetrics) -> String {
        let mut out = String::new();
        let success_rate = if metrics.total_generations > 0 {
            metrics.successful_generations as f64 / metrics.total_generations as f64 * 100.0
        } else {
            0.0
        };
        out.push_str(&format!(
            "generations: {} total ({:.1}% success)\n",
            metrics.total_generations, success_rate
        ));
        out.push_str(&format!(
            "avg generation time: {:.1}ms\n",
            metrics.average_generation_time_ms
        ));
        out.push_str(&format!(
            "memory: {:.0}/{:.0} MB, cpu: {:.1}%\n",
            metrics.memory_usage_mb, metrics.memory_total_mb, metrics.cpu_usage_percent
        ));
        out.push_str(&format!("uptime: {}s\n", metrics.uptime_seconds));
        out
    }

    /// Spawns a background task that refreshes resource gauges on
    /// `health_check_interval`. The returned handle is owned by the caller
    /// (the composition root), which aborts it on shutdown.
    pub fn start_metrics_collector(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.health_check_interval);
            loop {
                interval.tick().await;
                manager.update_system_metrics().await;
                let metrics = manager.get_metrics().await;
                info!(
                    total_generations = metrics.total_generations,
                    memory_usage_mb = metrics.memory_usage_mb,
                    "metrics tick"
                );
            }
        })
    }

    pub async fn get_metrics(&self) -> SystemMetrics {
        self.metrics.read().await.clone()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generation_recording_updates_totals_and_model_stats() {
        let obs = ObservabilityManager::new();
        obs.record_generation("sd3.5-medium", Duration::from_millis(1200), true)
            .await;
        obs.record_generation("sd3.5-medium", Duration::from_millis(800), false)
            .await;

        let metrics = obs.get_metrics().await;
        assert_eq!(metrics.total_generations, 2);
        assert_eq!(metrics.successful_generations, 1);
        assert_eq!(metrics.failed_generations, 1);
        let model = metrics.model_stats.get("sd3.5-medium").unwrap();
        assert_eq!(model.generations, 2);
        assert_eq!(model.errors, 1);
    }

    #[tokio::test]
    async fn prometheus_export_contains_known_metric_names() {
        let obs = ObservabilityManager::new();
        obs.record_generation("flux-2-klein", Duration::from_millis(500), true)
            .await;

        let export = obs.export_metrics().await;
        assert!(export.contains("genforge_generations_total"));
        assert!(export.contains("flux-2-klein"));
    }

    #[tokio::test]
    async fn system_metrics_refresh_sets_nonzero_memory_total() {
        let obs = ObservabilityManager::new();
        obs.update_system_metrics().await;
        let metrics = obs.get_metrics().await;
        assert!(metrics.memory_total_mb > 0.0);
    }
}
