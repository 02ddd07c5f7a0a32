use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use kiln_core::{
    status::{HealthReport, LorasReport, ModelsReport},
    ActivityClock, GenerationRequest, GenerationResult, Loader, Service, SwitchModelRequest,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;

use error::{ApiError, JsonFromRequest};

/// Reference images arrive inline as base64.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct SwitchModelResponse {
    pub status: &'static str,
    pub model: String,
}

pub fn router<L: Loader + 'static>(service: Arc<Service<L>>) -> Router {
    let clock = service.clock().clone();
    Router::new()
        .route("/health", get(health::<L>))
        .route("/models", get(models::<L>))
        .route("/loras", get(loras::<L>))
        .route("/switch-model", post(switch_model::<L>))
        .route("/generate", post(generate::<L>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(clock, record_activity))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Every inbound request, status polls included, resets the idle window.
async fn record_activity(
    State(clock): State<Arc<ActivityClock>>,
    request: Request,
    next: Next,
) -> Response {
    clock.touch();
    next.run(request).await
}

async fn health<L: Loader + 'static>(State(service): State<Arc<Service<L>>>) -> Json<HealthReport> {
    Json(service.health().await)
}

async fn models<L: Loader + 'static>(State(service): State<Arc<Service<L>>>) -> Json<ModelsReport> {
    Json(service.models())
}

async fn loras<L: Loader + 'static>(
    State(service): State<Arc<Service<L>>>,
) -> Result<Json<LorasReport>, ApiError> {
    Ok(Json(service.loras()?))
}

async fn switch_model<L: Loader + 'static>(
    State(service): State<Arc<Service<L>>>,
    JsonFromRequest(req): JsonFromRequest<SwitchModelRequest>,
) -> Result<Json<SwitchModelResponse>, ApiError> {
    service.switch_model(&req.model).await?;
    tracing::info!(model = %req.model, "switched model");
    Ok(Json(SwitchModelResponse {
        status: "ok",
        model: req.model,
    }))
}

async fn generate<L: Loader + 'static>(
    State(service): State<Arc<Service<L>>>,
    JsonFromRequest(req): JsonFromRequest<GenerationRequest>,
) -> Result<Json<GenerationResult>, ApiError> {
    Ok(Json(service.generate(req).await?))
}
