//! Engine control: status, metrics, manual sync and live configuration.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use ferry_engine::{ConfigPatch, DrainSummary, EngineStatus, SyncConfig, SyncMetrics};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/sync", post(manual_sync))
        .route("/config", get(current_config).patch(update_config))
}

async fn status(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<EngineStatus>> {
    Ok(Json(state.engine.status().await?))
}

async fn metrics(State(state): State<AppState>, _auth: AuthUser) -> Result<Json<SyncMetrics>> {
    Ok(Json(state.engine.metrics().await?))
}

/// POST /sync - drain the queue now. 409 while a drain runs, 503 offline.
async fn manual_sync(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<DrainSummary>> {
    tracing::info!(client = %auth.client, "Manual sync requested");
    Ok(Json(state.engine.manual_sync().await?))
}

async fn current_config(State(state): State<AppState>, _auth: AuthUser) -> Json<SyncConfig> {
    Json(state.engine.config())
}

/// PATCH /config - merge a partial config. Invalid results are rejected whole.
async fn update_config(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<SyncConfig>> {
    Ok(Json(state.engine.update_config(&patch)?))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{body_json, TestApp};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::body::Body;
    use ferry_engine::{Mutation, EntityType, RemoteError};
    use serde_json::json;

    #[tokio::test]
    async fn manual_sync_offline_is_unavailable() {
        let app = TestApp::new().await;
        let (status, body) = body_json(app.post("/sync", json!({})).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "network unreachable");
    }

    #[tokio::test]
    async fn manual_sync_drains_queue() {
        let app = TestApp::new().await;
        app.reachability.set(true);
        app.state
            .engine
            .apply(Mutation::create(EntityType::Client, "c-1", json!({"name": "Acme"})))
            .await
            .unwrap();
        app.state
            .engine
            .apply(Mutation::create(EntityType::Site, "s-1", json!({"name": "Depot"})))
            .await
            .unwrap();
        app.remote.push(Err(RemoteError::Transient("timeout".into())));

        let (status, summary) = body_json(app.post("/sync", json!({})).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["attempted"], 2);
        assert_eq!(summary["succeeded"], 1);
        assert_eq!(summary["failed"], 1);
        assert_eq!(app.remote.calls().len(), 2);

        let (_, metrics) = body_json(app.get("/metrics").await).await;
        assert_eq!(metrics["totalOperations"], 2);
        assert_eq!(metrics["successfulOperations"], 1);
        assert_eq!(metrics["pendingOperations"], 1);

        let (_, status) = body_json(app.get("/status").await).await;
        assert_eq!(status["scheduler"], "STOPPED");
        assert_eq!(status["reachable"], true);
        assert_eq!(status["queue"]["retryScheduled"], 1);
    }

    #[tokio::test]
    async fn config_patch_validates() {
        let app = TestApp::new().await;

        let (status, config) =
            body_json(app.patch("/config", json!({"batchSize": 50, "syncIntervalMs": 5000})).await)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config["batchSize"], 50);
        assert_eq!(config["syncIntervalMs"], 5000);

        let (status, _) = body_json(app.patch("/config", json!({"batchSize": 0})).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Rejected patch leaves the previous value in place
        let (_, config) = body_json(app.get("/config").await).await;
        assert_eq!(config["batchSize"], 50);
    }

    #[tokio::test]
    async fn secret_is_enforced() {
        let app = TestApp::with_secret(Some("s3cret")).await;

        assert_eq!(app.get("/status").await.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .method(Method::GET)
            .uri("/status")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.send(wrong).await.status(), StatusCode::UNAUTHORIZED);

        let right = Request::builder()
            .method(Method::GET)
            .uri("/status")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.send(right).await.status(), StatusCode::OK);

        // Health stays open for probes
        assert_eq!(app.get("/health").await.status(), StatusCode::OK);
    }
}
