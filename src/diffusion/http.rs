//! HTTP front for the diffusion server (§4.3.2, §6.1). Router shape and the
//! CORS layer are grounded on the donor candle-server's `CorsLayer::new()`
//! wiring; the diffusion server additionally allows DELETE per §6.1.

use super::pipeline::{GenerationRequest, Sampler};
use super::registry::GenerationState;
use super::DiffusionServer;
use crate::error::CoreError;
use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn router(server: Arc<DiffusionServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::any());

    Router::new()
        .route("/health", get(health))
        .route("/v1/images/generations", post(create_generation))
        .route("/v1/images/generations/:id", get(get_generation))
        .layer(cors)
        .with_state(server)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    busy: bool,
}

async fn health(State(server): State<Arc<DiffusionServer>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        busy: server.is_busy(),
    })
}

/// Wire request body for `POST /v1/images/generations` (§6.1). Field names
/// are camelCase on the wire; `serde(rename_all)` does the translation so the
/// rest of the core stays snake_case.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGenerationBody {
    prompt: String,
    negative_prompt: Option<String>,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default = "default_steps")]
    steps: u32,
    #[serde(default = "default_cfg_scale")]
    cfg_scale: f32,
    #[serde(default = "default_seed")]
    seed: i64,
    #[serde(default = "default_sampler")]
    sampler: String,
    #[serde(default = "default_count")]
    count: u32,
}

fn default_width() -> u32 {
    512
}
fn default_height() -> u32 {
    512
}
fn default_steps() -> u32 {
    20
}
fn default_cfg_scale() -> f32 {
    7.5
}
fn default_seed() -> i64 {
    -1
}
fn default_sampler() -> String {
    "euler_a".into()
}
fn default_count() -> u32 {
    1
}

#[derive(Serialize)]
struct CreateGenerationResponse {
    id: String,
    status: &'static str,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn create_generation(
    State(server): State<Arc<DiffusionServer>>,
    body: Result<Json<CreateGenerationBody>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return invalid_request(format!("malformed request body: {e}")).into_response();
        }
    };

    if body.prompt.trim().is_empty() {
        return invalid_request("prompt must not be empty".into()).into_response();
    }
    if !(1..=5).contains(&body.count) {
        return invalid_request("count must be between 1 and 5".into()).into_response();
    }
    let sampler = match Sampler::parse(&body.sampler) {
        Some(s) => s,
        None => {
            return invalid_request(format!("unknown sampler '{}'", body.sampler)).into_response()
        }
    };

    let req = GenerationRequest {
        prompt: body.prompt,
        negative_prompt: body.negative_prompt,
        width: body.width,
        height: body.height,
        steps: body.steps,
        cfg_scale: body.cfg_scale,
        seed: body.seed,
        sampler,
        count: body.count,
    };

    match server.accept_generation(req) {
        Ok(state) => (
            axum::http::StatusCode::CREATED,
            Json(CreateGenerationResponse {
                id: state.id,
                status: "pending",
                created_at: state.created_at,
            }),
        )
            .into_response(),
        Err(e) => server_busy_or_error(e).into_response(),
    }
}

fn invalid_request(message: String) -> impl IntoResponse {
    (
        axum::http::StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": { "message": message, "code": "INVALID_REQUEST" }
        })),
    )
}

fn server_busy_or_error(e: CoreError) -> impl IntoResponse {
    if e.code() == "SERVER_ERROR" {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": {
                    "message": e.to_string(),
                    "code": "SERVER_BUSY",
                    "suggestion": "wait for the current generation to finish and retry",
                }
            })),
        )
            .into_response()
    } else {
        e.into_response()
    }
}

async fn get_generation(
    State(server): State<Arc<DiffusionServer>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match server.registry().get(&id) {
        Some(state) => Json(GenerationStateView::from(state)).into_response(),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "message": format!("no generation with id '{id}'"), "code": "NOT_FOUND" }
            })),
        )
            .into_response(),
    }
}

/// Mirrors `GenerationState` but renamed to the wire's camelCase envelope
/// (§6.1: `{id, status, createdAt, updatedAt, [progress], [result], [error]}`).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationStateView {
    id: String,
    status: super::registry::Status,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<super::registry::Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<super::registry::GenerationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<super::registry::GenerationError>,
}

impl From<GenerationState> for GenerationStateView {
    fn from(s: GenerationState) -> Self {
        Self {
            id: s.id,
            status: s.status,
            created_at: s.created_at,
            updated_at: s.updated_at,
            progress: s.progress,
            result: s.result,
            error: s.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_manager::BinaryManager;
    use crate::capability::{CapabilityOracle, CapabilitySnapshot, CpuInfo, GpuInfo, GpuType, MemoryInfo};
    use crate::llm_collaborator::{LlmConfig, LlmServerManager};
    use crate::model_manager::ModelManager;
    use crate::orchestrator::Orchestrator;
    use crate::port_manager::PortAllocator;
    use async_trait::async_trait;
    use tower::ServiceExt;

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

    fn test_server(tmp: &std::path::Path) -> Arc<DiffusionServer> {
        let capability: Arc<dyn CapabilityOracle> = Arc::new(FakeOracle);
        let models = Arc::new(ModelManager::new(tmp.join("models")));
        let binaries = Arc::new(BinaryManager::new(tmp.join("bin"), capability.clone()));
        let orchestrator = Arc::new(Orchestrator::new(capability.clone(), Arc::new(NoLlm)));
        let ports = Arc::new(PortAllocator::new());
        Arc::new(DiffusionServer::new(models, binaries, capability, orchestrator, ports))
    }

    #[tokio::test]
    async fn health_reports_not_busy_initially() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_server(tmp.path()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn create_generation_rejects_empty_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_server(tmp.path()));
        let body = serde_json::json!({"prompt": ""});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/images/generations")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_generation_rejects_out_of_range_count() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_server(tmp.path()));
        let body = serde_json::json!({"prompt": "a cat", "count": 9});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/images/generations")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_generation_returns_404_for_unknown_id() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_server(tmp.path()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/images/generations/does-not-exist")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_generation_fails_when_server_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_server(tmp.path()));
        let body = serde_json::json!({"prompt": "a cat"});
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/images/generations")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
