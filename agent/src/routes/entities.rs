//! Local entity writes. Every write is applied locally and queued for sync.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use ferry_engine::{Entity, EntityType, Mutation, Priority};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

/// Body of create and update requests.
#[derive(Debug, Deserialize)]
pub struct EntityWrite {
    pub payload: serde_json::Value,
    /// Queue priority; higher syncs first
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub priority: Priority,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities/{entity_type}", get(list_entities))
        .route(
            "/entities/{entity_type}/{id}",
            get(get_entity)
                .post(create_entity)
                .put(update_entity)
                .delete(delete_entity),
        )
}

fn entity_type(segment: &str) -> Result<EntityType> {
    EntityType::from_path_segment(segment)
        .ok_or_else(|| AppError::BadRequest(format!("unknown entity type '{segment}'")))
}

async fn list_entities(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(segment): Path<String>,
) -> Result<Json<Vec<Entity>>> {
    let entity_type = entity_type(&segment)?;
    Ok(Json(state.engine.list(entity_type).await?))
}

async fn get_entity(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((segment, id)): Path<(String, String)>,
) -> Result<Json<Entity>> {
    let entity_type = entity_type(&segment)?;
    state
        .engine
        .get(entity_type, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{segment}/{id}")))
}

async fn create_entity(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((segment, id)): Path<(String, String)>,
    Json(body): Json<EntityWrite>,
) -> Result<(StatusCode, Json<Entity>)> {
    let mutation = Mutation::create(entity_type(&segment)?, id, body.payload)
        .with_priority(body.priority);
    let entity = state.engine.apply(mutation).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn update_entity(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((segment, id)): Path<(String, String)>,
    Json(body): Json<EntityWrite>,
) -> Result<Json<Entity>> {
    let mutation = Mutation::update(entity_type(&segment)?, id, body.payload)
        .with_priority(body.priority);
    Ok(Json(state.engine.apply(mutation).await?))
}

/// DELETE /entities/{type}/{id} - leaves a local tombstone and queues the delete.
async fn delete_entity(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((segment, id)): Path<(String, String)>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Entity>> {
    let mutation = Mutation::delete(entity_type(&segment)?, id).with_priority(params.priority);
    Ok(Json(state.engine.apply(mutation).await?))
}
