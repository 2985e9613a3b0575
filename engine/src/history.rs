//! Conflict history.
//!
//! Every detected conflict is appended to a [`ConflictLog`]. Records are never
//! deleted; a deferred record is sealed exactly once when a person resolves it.

use crate::{
    conflict::{ConflictRecord, Resolution},
    error::Result,
    EntityId, EntityType, Error, OperationId, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Filter for [`ConflictLog::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFilter {
    pub operation_id: Option<OperationId>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<EntityId>,
    /// `Some(true)` for unresolved records only, `Some(false)` for resolved
    pub pending: Option<bool>,
    pub limit: Option<usize>,
}

impl ConflictFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending() -> Self {
        Self {
            pending: Some(true),
            ..Self::default()
        }
    }

    pub fn operation(mut self, operation_id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn entity(mut self, entity_type: EntityType, entity_id: impl Into<EntityId>) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ConflictRecord) -> bool {
        self.operation_id
            .as_ref()
            .map_or(true, |id| &record.operation_id == id)
            && self.entity_type.map_or(true, |t| record.entity_type == t)
            && self
                .entity_id
                .as_ref()
                .map_or(true, |id| &record.entity_id == id)
            && self.pending.map_or(true, |p| record.is_pending() == p)
    }
}

/// Append-only store of [`ConflictRecord`]s.
#[async_trait]
pub trait ConflictLog: Send + Sync {
    async fn append(&self, record: ConflictRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>>;

    /// Records matching `filter`, oldest first.
    async fn query(&self, filter: &ConflictFilter) -> Result<Vec<ConflictRecord>>;

    /// Resolve a pending record. Fails if it is unknown or already resolved.
    async fn seal(
        &self,
        id: &str,
        resolution: &Resolution,
        resolved_by: &str,
        now: Timestamp,
    ) -> Result<ConflictRecord>;
}

/// In-memory [`ConflictLog`].
#[derive(Debug, Default)]
pub struct MemoryConflictLog {
    records: Mutex<Vec<ConflictRecord>>,
}

impl MemoryConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ConflictRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Storage("conflict log lock poisoned".into()))
    }
}

#[async_trait]
impl ConflictLog for MemoryConflictLog {
    async fn append(&self, record: ConflictRecord) -> Result<()> {
        tracing::debug!(
            conflict_id = %record.id,
            operation_id = %record.operation_id,
            conflict_type = %record.conflict_type,
            "Conflict recorded"
        );
        self.lock()?.push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }

    async fn query(&self, filter: &ConflictFilter) -> Result<Vec<ConflictRecord>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn seal(
        &self,
        id: &str,
        resolution: &Resolution,
        resolved_by: &str,
        now: Timestamp,
    ) -> Result<ConflictRecord> {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;

        record.seal(resolution, resolved_by, now)?;
        Ok(record.clone())
    }
}
