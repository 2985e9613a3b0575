//! Remote API collaborator.
//!
//! The coordinator talks to the remote authority only through [`RemoteApi`].
//! Implementations are responsible for their own request timeouts and must
//! classify every failure as a conflict, a transient error or a permanent one.

use crate::{OperationKind, SyncOperation, Timestamp, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current state of an entity as reported by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVersion {
    pub payload: serde_json::Value,
    pub version: Version,
    pub updated_at: Timestamp,
    /// The remote holds a tombstone for this entity
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteVersion {
    pub fn live(payload: serde_json::Value, version: Version, updated_at: Timestamp) -> Self {
        Self {
            payload,
            version,
            updated_at,
            deleted: false,
        }
    }

    pub fn tombstone(version: Version, updated_at: Timestamp) -> Self {
        Self {
            payload: serde_json::Value::Null,
            version,
            updated_at,
            deleted: true,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Successful remote write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    pub version: Option<Version>,
    pub updated_at: Option<Timestamp>,
}

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The remote rejected the write because its state diverged.
    /// `None` means the remote holds no record for the entity.
    #[error("remote conflict")]
    Conflict(Option<RemoteVersion>),

    /// Network failure, timeout or server-side error; worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The request can never succeed as sent.
    #[error("permanent remote error: {0}")]
    Permanent(String),
}

pub type RemoteResult = std::result::Result<RemoteAck, RemoteError>;

/// Per-entity-type create/update/delete against the remote authority.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, op: &SyncOperation) -> RemoteResult;

    /// Update, conditional on `op.base_version`.
    async fn update(&self, op: &SyncOperation) -> RemoteResult;

    /// Delete, conditional on `op.base_version`.
    async fn delete(&self, op: &SyncOperation) -> RemoteResult;

    /// Dispatch on the operation kind.
    async fn send(&self, op: &SyncOperation) -> RemoteResult {
        match op.kind {
            OperationKind::Create => self.create(op).await,
            OperationKind::Update => self.update(op).await,
            OperationKind::Delete => self.delete(op).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityType;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RemoteApi for Recorder {
        async fn create(&self, _op: &SyncOperation) -> RemoteResult {
            self.calls.lock().unwrap().push("create");
            Ok(RemoteAck::default())
        }

        async fn update(&self, _op: &SyncOperation) -> RemoteResult {
            self.calls.lock().unwrap().push("update");
            Err(RemoteError::Transient("timeout".into()))
        }

        async fn delete(&self, _op: &SyncOperation) -> RemoteResult {
            self.calls.lock().unwrap().push("delete");
            Err(RemoteError::Conflict(None))
        }
    }

    fn op(kind: OperationKind) -> SyncOperation {
        SyncOperation::new(kind, EntityType::Site, "site-1", json!({}), 0)
    }

    #[tokio::test]
    async fn send_dispatches_on_kind() {
        let remote = Recorder::default();
        assert!(remote.send(&op(OperationKind::Create)).await.is_ok());
        assert_eq!(
            remote.send(&op(OperationKind::Update)).await,
            Err(RemoteError::Transient("timeout".into()))
        );
        assert_eq!(
            remote.send(&op(OperationKind::Delete)).await,
            Err(RemoteError::Conflict(None))
        );
        assert_eq!(*remote.calls.lock().unwrap(), vec!["create", "update", "delete"]);
    }

    #[test]
    fn remote_version_wire_format() {
        let parsed: RemoteVersion = serde_json::from_value(json!({
            "payload": {"name": "Depot"},
            "version": 4,
            "updatedAt": 1700
        }))
        .unwrap();
        assert_eq!(parsed, RemoteVersion::live(json!({"name": "Depot"}), 4, 1700));
        assert!(parsed.is_live());
        assert!(!RemoteVersion::tombstone(5, 1800).is_live());
    }
}
