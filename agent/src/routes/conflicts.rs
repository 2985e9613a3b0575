//! Conflict history and manual resolution.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use ferry_engine::{ConflictFilter, ConflictRecord, ManualResolution, SyncOperation};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

/// Body of `POST /conflicts/{id}/resolve`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// `{"choice": "KEEP_LOCAL"}`, `{"choice": "KEEP_REMOTE"}` or
    /// `{"choice": "CUSTOM", "payload": {...}}`
    pub resolution: ManualResolution,
    /// Recorded on the conflict; defaults to the caller identity
    #[serde(default)]
    pub resolved_by: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/{id}", get(get_conflict))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

/// GET /conflicts?pending=&operationId=&entityType=&entityId=&limit=
async fn list_conflicts(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(filter): Query<ConflictFilter>,
) -> Result<Json<Vec<ConflictRecord>>> {
    Ok(Json(state.engine.conflicts(&filter).await?))
}

async fn get_conflict(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ConflictRecord>> {
    Ok(Json(state.engine.conflict(&id).await?))
}

/// POST /conflicts/{id}/resolve - apply a person's decision to a deferred conflict.
async fn resolve_conflict(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<SyncOperation>> {
    let resolved_by = request.resolved_by.unwrap_or(auth.client);
    let op = state
        .engine
        .resolve_conflict(&id, &request.resolution, &resolved_by)
        .await?;
    Ok(Json(op))
}
