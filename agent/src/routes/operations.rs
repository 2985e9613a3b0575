//! Queue inspection and manual intervention.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use ferry_engine::{OperationFilter, QueueStats, SyncOperation};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/operations", get(list_operations))
        .route("/operations/stats", get(stats))
        .route("/operations/completed", delete(remove_completed))
        .route("/operations/{id}", get(get_operation).delete(clear_operation))
        .route("/operations/{id}/retry", post(retry_operation))
}

/// GET /operations?status=&entityType=&entityId=&limit=
async fn list_operations(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(filter): Query<OperationFilter>,
) -> Result<Json<Vec<SyncOperation>>> {
    Ok(Json(state.engine.operations(&filter).await?))
}

async fn stats(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<QueueStats>> {
    Ok(Json(state.engine.stats().await?))
}

async fn get_operation(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SyncOperation>> {
    Ok(Json(state.engine.operation(&id).await?))
}

/// POST /operations/{id}/retry - requeue a FAILED or CONFLICT operation with a fresh budget.
async fn retry_operation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SyncOperation>> {
    let op = state.engine.retry_operation(&id).await?;
    tracing::info!(operation_id = %id, client = %auth.client, "Operation requeued by hand");
    Ok(Json(op))
}

/// DELETE /operations/{id} - drop a terminal operation.
async fn clear_operation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SyncOperation>> {
    let op = state.engine.clear_operation(&id).await?;
    tracing::info!(operation_id = %id, client = %auth.client, "Operation cleared by hand");
    Ok(Json(op))
}

async fn remove_completed(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<RemovedResponse>> {
    let removed = state.engine.remove_completed().await?;
    Ok(Json(RemovedResponse { removed }))
}
