//! HTTP route definitions.

mod conflicts;
mod entities;
mod events;
mod health;
mod operations;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(operations::routes())
        .merge(conflicts::routes())
        .merge(entities::routes())
        .merge(events::routes())
}
