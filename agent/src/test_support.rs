//! Fixtures for router tests: SQLite in memory, a scripted remote, oneshot requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use ferry_engine::{
    ReachabilitySignal, RemoteAck, RemoteApi, RemoteResult, SyncConfig, SyncOperation,
};
use serde_json::Value;
use tower::ServiceExt;

use crate::config::Config;
use crate::db::memory_pool;
use crate::websocket::ConnectionManager;
use crate::{app, build_engine, AppState};

/// Remote that replays scripted results, then accepts everything.
#[derive(Default)]
pub struct StubRemote {
    script: Mutex<VecDeque<RemoteResult>>,
    calls: Mutex<Vec<SyncOperation>>,
}

impl StubRemote {
    pub fn push(&self, result: RemoteResult) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<SyncOperation> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, op: &SyncOperation) -> RemoteResult {
        self.calls.lock().unwrap().push(op.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RemoteAck::default()))
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn create(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op)
    }

    async fn update(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op)
    }

    async fn delete(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op)
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub remote: Arc<StubRemote>,
    pub reachability: Arc<ReachabilitySignal>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_secret(None).await
    }

    pub async fn with_secret(auth_secret: Option<&str>) -> Self {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            remote_base_url: "http://remote.invalid".into(),
            remote_token: None,
            remote_timeout: Duration::from_secs(1),
            probe_interval: Duration::from_secs(1),
            auth_secret: auth_secret.map(str::to_string),
            sync: SyncConfig {
                batch_delay_ms: 0,
                ..SyncConfig::default()
            },
        };

        let pool = memory_pool().await;
        let remote = Arc::new(StubRemote::default());
        let reachability = Arc::new(ReachabilitySignal::new(false));
        let engine = build_engine(&pool, &config, remote.clone(), reachability.clone()).unwrap();

        let state = AppState {
            pool,
            config: Arc::new(config),
            engine: Arc::new(engine),
            conn_manager: ConnectionManager::new_shared(),
        };

        Self {
            router: app(state.clone()),
            state,
            remote,
            reachability,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> Response {
        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, body: Value) -> Response {
        self.request(Method::PATCH, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.request(Method::DELETE, uri, None).await
    }
}

/// Split a response into its status and JSON body (`Null` when empty).
pub async fn body_json(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}
