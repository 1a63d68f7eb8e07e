//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ArbitrageService>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::service::{ArbitrageService, ServiceStatus};
use crate::types::{
    Asset, EngineError, Execution, ScanRequest, ScanResult, Task, TaskParams, TaskStatistics,
};

pub type AppState = Arc<ArbitrageService>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            EngineError::InvalidParameters(_) => (StatusCode::BAD_REQUEST, "invalid_parameters"),
            EngineError::InsufficientBudget { .. } => (StatusCode::BAD_REQUEST, "insufficient_budget"),
            EngineError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            EngineError::ChainNotFound(_) => (StatusCode::NOT_FOUND, "chain_not_found"),
            EngineError::InvalidTaskState { .. } => (StatusCode::CONFLICT, "invalid_task_state"),
            EngineError::RateExpired { .. } => (StatusCode::CONFLICT, "rate_expired"),
            EngineError::CircuitBreakerTripped(_) => (StatusCode::CONFLICT, "circuit_breaker_tripped"),
            EngineError::RateUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "rate_unavailable"),
            EngineError::ConnectorTransient(_) => (StatusCode::BAD_GATEWAY, "connector_transient"),
            EngineError::ConnectorFatal(_) => (StatusCode::BAD_GATEWAY, "connector_fatal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: kind.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub chain_id: String,
    pub amount: Decimal,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/status
pub async fn get_status(State(svc): State<AppState>) -> Json<ServiceStatus> {
    Json(svc.status().await)
}

/// POST /api/arbitrage/scan
pub async fn scan(State(svc): State<AppState>, Json(req): Json<ScanRequest>) -> ApiResult<ScanResult> {
    Ok(Json(svc.scan(&req).await?))
}

/// GET /api/arbitrage/assets
pub async fn list_assets(State(svc): State<AppState>) -> ApiResult<Vec<Asset>> {
    Ok(Json(svc.list_assets().await?))
}

/// POST /api/arbitrage/execute
pub async fn execute_chain(
    State(svc): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Execution> {
    Ok(Json(svc.execute_chain(&req.chain_id, req.amount).await?))
}

/// GET /api/arbitrage/executions
pub async fn list_executions(State(svc): State<AppState>) -> Json<Vec<Execution>> {
    Json(svc.manual_executions().await)
}

/// GET /api/tasks
pub async fn list_tasks(State(svc): State<AppState>) -> Json<Vec<Task>> {
    Json(svc.list_tasks().await)
}

/// POST /api/tasks
pub async fn create_task(
    State(svc): State<AppState>,
    Json(params): Json<TaskParams>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = svc.create_task(params).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks/:id
pub async fn get_task(State(svc): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(svc.get_task(&id).await?))
}

/// DELETE /api/tasks/:id
pub async fn delete_task(State(svc): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    svc.delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/:id/start
pub async fn start_task(State(svc): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(svc.start_task(&id).await?))
}

/// POST /api/tasks/:id/stop
pub async fn stop_task(State(svc): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(svc.stop_task(&id).await?))
}

/// GET /api/tasks/:id/statistics
pub async fn task_statistics(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskStatistics> {
    Ok(Json(svc.task_statistics(&id).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
