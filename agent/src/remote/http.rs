//! HTTP client for the remote API.
//!
//! Endpoints per entity type:
//!
//! ```text
//! POST   {base}/{type}        create
//! PUT    {base}/{type}/{id}   update, If-Match: <baseVersion>
//! DELETE {base}/{type}/{id}   delete, If-Match: <baseVersion>
//! ```

use async_trait::async_trait;
use ferry_engine::{
    OperationKind, RemoteAck, RemoteApi, RemoteError, RemoteResult, RemoteVersion, SyncOperation,
};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Body of a 409 response.
#[derive(Debug, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    remote: Option<RemoteVersion>,
}

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    fn collection_url(&self, op: &SyncOperation) -> String {
        format!("{}/{}", self.base_url, op.entity_type.path_segment())
    }

    fn entity_url(&self, op: &SyncOperation) -> String {
        format!("{}/{}", self.collection_url(op), op.entity_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, op: &SyncOperation, request: RequestBuilder) -> RemoteResult {
        let response = self.authorize(request).send().await.map_err(|e| {
            tracing::warn!(operation_id = %op.id, error = %e, "Remote request failed");
            RemoteError::Transient(e.to_string())
        })?;
        classify(op.kind, response).await
    }
}

/// Turn an HTTP response into the engine's remote outcome.
async fn classify(kind: OperationKind, response: Response) -> RemoteResult {
    let status = response.status();

    if status.is_success() {
        // Acks may carry an empty body
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        return Ok(serde_json::from_slice(&bytes).unwrap_or_default());
    }

    match status {
        StatusCode::CONFLICT => {
            let body: ConflictBody = response
                .json()
                .await
                .map_err(|e| RemoteError::Permanent(format!("malformed conflict body: {e}")))?;
            Err(RemoteError::Conflict(body.remote))
        }
        StatusCode::NOT_FOUND if kind != OperationKind::Create => Err(RemoteError::Conflict(None)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(RemoteError::Transient(format!("remote answered {status}")))
        }
        s if s.is_server_error() => Err(RemoteError::Transient(format!("remote answered {s}"))),
        s => {
            let detail = response.text().await.unwrap_or_default();
            Err(RemoteError::Permanent(format!("remote answered {s}: {detail}")))
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(&self, op: &SyncOperation) -> RemoteResult {
        let request = self.client.post(self.collection_url(op)).json(&op.payload);
        self.execute(op, request).await
    }

    async fn update(&self, op: &SyncOperation) -> RemoteResult {
        let request = self
            .client
            .put(self.entity_url(op))
            .header(header::IF_MATCH, op.base_version.to_string())
            .json(&op.payload);
        self.execute(op, request).await
    }

    async fn delete(&self, op: &SyncOperation) -> RemoteResult {
        let request = self
            .client
            .delete(self.entity_url(op))
            .header(header::IF_MATCH, op.base_version.to_string());
        self.execute(op, request).await
    }
}
