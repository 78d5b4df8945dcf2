use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use node_common::{InstanceId, InstanceRecord, ProvisionRequest, ProvisionResult, TrafficSnapshot};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::instrument;

use crate::api_server::{ApiError, ApiState};

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/instances", get(list_instances_handler))
        .route("/api/provisioning/container", post(provision_handler))
        .route(
            "/api/provisioning/container/:instance_id",
            delete(deprovision_handler),
        )
        .route(
            "/api/provisioning/container/:instance_id/status",
            get(status_handler),
        )
        .route(
            "/api/provisioning/container/:instance_id/logs",
            get(logs_handler),
        )
        .route(
            "/api/provisioning/container/:instance_id/pause",
            post(pause_handler),
        )
        .route(
            "/api/provisioning/container/:instance_id/resume",
            post(resume_handler),
        )
        .route(
            "/api/provisioning/container/:instance_id/traffic",
            get(traffic_handler),
        )
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Validation failures come back as a failure result, not an HTTP error.
async fn provision_handler(
    State(state): State<ApiState>,
    Json(request): Json<ProvisionRequest>,
) -> Json<ProvisionResult> {
    Json(state.orchestrator.provision(request).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionResponse {
    pub instance_id: InstanceId,
    pub success: bool,
    pub message: String,
    pub failed_steps: Vec<String>,
}

#[instrument(skip(state))]
async fn deprovision_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> Json<DeprovisionResponse> {
    let outcome = state.orchestrator.deprovision(instance_id).await;
    Json(DeprovisionResponse {
        instance_id,
        success: outcome.is_clean(),
        message: outcome.to_string(),
        failed_steps: outcome.failed_steps,
    })
}

async fn status_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> String {
    state.orchestrator.status(instance_id).await
}

#[instrument(skip(state))]
async fn logs_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> Result<String, ApiError> {
    Ok(state.orchestrator.logs(instance_id).await?)
}

#[instrument(skip(state))]
async fn pause_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> Result<String, ApiError> {
    Ok(state.orchestrator.pause(instance_id).await?)
}

#[instrument(skip(state))]
async fn resume_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> Result<String, ApiError> {
    Ok(state.orchestrator.resume(instance_id).await?)
}

async fn traffic_handler(
    State(state): State<ApiState>,
    Path(instance_id): Path<InstanceId>,
) -> Result<Json<TrafficSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.instance_traffic(instance_id).await?))
}

async fn list_instances_handler(
    State(state): State<ApiState>,
) -> Result<Json<Vec<InstanceRecord>>, ApiError> {
    Ok(Json(state.orchestrator.list_instances().await?))
}
