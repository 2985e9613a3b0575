//! Error types for the Ferry engine.

use crate::{EntityId, EntityType, OperationId, SyncStatus};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unrecognized value: {0}")]
    Unrecognized(String),

    // Queue errors
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("operation already queued: {0}")]
    DuplicateOperation(OperationId),

    #[error("invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("retries exhausted for operation {id} ({retries} attempts)")]
    RetriesExhausted { id: OperationId, retries: u32 },

    #[error("operation {0} is not terminal and cannot be cleared")]
    NotTerminal(OperationId),

    // Entity errors
    #[error("entity not found: {entity_type}/{id}")]
    EntityNotFound { entity_type: EntityType, id: EntityId },

    #[error("entity already exists: {entity_type}/{id}")]
    EntityExists { entity_type: EntityType, id: EntityId },

    // Conflict errors
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    // Engine state errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sync in progress")]
    SyncInProgress,

    #[error("network unreachable")]
    Offline,
}

impl Error {
    /// Whether the error came from the persistence layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Serialization(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
