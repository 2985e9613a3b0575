//! Operation Store - durable, indexed persistence for queued operations.
//!
//! [`OperationStore`] is the only shared mutable resource between the gateway,
//! scheduler and coordinator. Every mutation goes through `enqueue`,
//! `dequeue_next` or `update_status`, and every implementation applies the
//! transition rules from [`SyncOperation::apply_change`].
//!
//! [`MemoryOperationStore`] keeps secondary indexes on status, entity type and
//! entity id, plus a priority-ordered index of PENDING operations.

use crate::{
    error::Result, EntityId, EntityType, Error, OperationId, Priority, StatusChange,
    SyncOperation, SyncStatus, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Filter for [`OperationStore::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFilter {
    pub status: Option<SyncStatus>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<EntityId>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl OperationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check an operation against the status/type/id criteria (ignores limit).
    pub fn matches(&self, op: &SyncOperation) -> bool {
        self.status.map_or(true, |s| op.status == s)
            && self.entity_type.map_or(true, |t| op.entity_type == t)
            && self.entity_id.as_ref().map_or(true, |id| &op.entity_id == id)
    }
}

/// Operation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflict: usize,
    pub retry_scheduled: usize,
}

impl QueueStats {
    /// Count one more operation in `status`.
    pub fn record(&mut self, status: SyncStatus) {
        self.add(status, 1);
    }

    /// Count `n` more operations in `status`.
    pub fn add(&mut self, status: SyncStatus, n: usize) {
        self.total += n;
        match status {
            SyncStatus::Pending => self.pending += n,
            SyncStatus::InProgress => self.in_progress += n,
            SyncStatus::Completed => self.completed += n,
            SyncStatus::Failed => self.failed += n,
            SyncStatus::Conflict => self.conflict += n,
            SyncStatus::RetryScheduled => self.retry_scheduled += n,
        }
    }

    /// Operations still waiting to reach the remote.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_progress + self.retry_scheduled
    }
}

/// Durable CRUD over [`SyncOperation`] plus indexed queries.
///
/// Failures are persistence errors and must be propagated by callers.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a new operation. Rejects an id that is already queued.
    async fn enqueue(&self, op: SyncOperation) -> Result<OperationId>;

    /// Fetch an operation by id.
    async fn get(&self, id: &str) -> Result<Option<SyncOperation>>;

    /// Atomically take the highest-priority PENDING operation (earliest first
    /// within a priority) and move it to IN_PROGRESS.
    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<SyncOperation>>;

    /// Apply a status transition and return the updated operation.
    async fn update_status(
        &self,
        id: &str,
        change: StatusChange,
        now: Timestamp,
    ) -> Result<SyncOperation>;

    /// Operations matching `filter`, in creation order.
    async fn query(&self, filter: &OperationFilter) -> Result<Vec<SyncOperation>>;

    /// Remove a single terminal operation.
    async fn remove(&self, id: &str) -> Result<SyncOperation>;

    /// Garbage-collect COMPLETED operations. Returns how many were removed.
    async fn remove_completed(&self) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Move every due RETRY_SCHEDULED operation back to PENDING.
    async fn promote_due(&self, now: Timestamp) -> Result<Vec<SyncOperation>> {
        let scheduled = self
            .query(&OperationFilter::new().status(SyncStatus::RetryScheduled))
            .await?;

        let mut promoted = Vec::new();
        for op in scheduled.into_iter().filter(|op| op.is_due(now)) {
            promoted.push(
                self.update_status(&op.id, StatusChange::pending(), now)
                    .await?,
            );
        }
        Ok(promoted)
    }

    /// Put a FAILED or CONFLICT operation back in line with a fresh retry budget.
    async fn requeue(&self, id: &str, now: Timestamp) -> Result<SyncOperation> {
        self.update_status(id, StatusChange::retry_at(now).reset_retries(), now)
            .await?;
        self.update_status(id, StatusChange::pending(), now).await
    }
}

/// Key of the pending index: priority descending, then creation order.
type PendingKey = (Reverse<Priority>, Timestamp, u64, OperationId);

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    op: SyncOperation,
}

impl Entry {
    fn pending_key(&self) -> PendingKey {
        (
            Reverse(self.op.priority),
            self.op.created_at,
            self.seq,
            self.op.id.clone(),
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    ops: HashMap<OperationId, Entry>,
    /// seq -> id, per status
    by_status: HashMap<SyncStatus, BTreeMap<u64, OperationId>>,
    by_type: HashMap<EntityType, BTreeMap<u64, OperationId>>,
    by_entity: HashMap<EntityId, BTreeMap<u64, OperationId>>,
    pending: BTreeSet<PendingKey>,
}

impl Inner {
    fn index(&mut self, entry: &Entry) {
        let id = entry.op.id.clone();
        self.by_status
            .entry(entry.op.status)
            .or_default()
            .insert(entry.seq, id.clone());
        self.by_type
            .entry(entry.op.entity_type)
            .or_default()
            .insert(entry.seq, id.clone());
        self.by_entity
            .entry(entry.op.entity_id.clone())
            .or_default()
            .insert(entry.seq, id);
        if entry.op.status == SyncStatus::Pending {
            self.pending.insert(entry.pending_key());
        }
    }

    fn unindex(&mut self, entry: &Entry) {
        if let Some(ids) = self.by_status.get_mut(&entry.op.status) {
            ids.remove(&entry.seq);
        }
        if let Some(ids) = self.by_type.get_mut(&entry.op.entity_type) {
            ids.remove(&entry.seq);
        }
        if let Some(ids) = self.by_entity.get_mut(&entry.op.entity_id) {
            ids.remove(&entry.seq);
            if ids.is_empty() {
                self.by_entity.remove(&entry.op.entity_id);
            }
        }
        if entry.op.status == SyncStatus::Pending {
            self.pending.remove(&entry.pending_key());
        }
    }

    fn transition(
        &mut self,
        id: &str,
        change: &StatusChange,
        now: Timestamp,
    ) -> Result<SyncOperation> {
        let current = self
            .ops
            .get(id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

        let mut next = current.clone();
        next.op.apply_change(change, now)?;

        self.unindex(&current);
        self.index(&next);
        let op = next.op.clone();
        self.ops.insert(op.id.clone(), next);
        Ok(op)
    }

    fn remove_entry(&mut self, id: &str) -> Option<SyncOperation> {
        let entry = self.ops.remove(id)?;
        self.unindex(&entry);
        Some(entry.op)
    }

    /// Candidate ids for a filter, in creation order, from the narrowest index.
    fn candidates(&self, filter: &OperationFilter) -> Vec<OperationId> {
        let index = if let Some(entity_id) = &filter.entity_id {
            self.by_entity.get(entity_id)
        } else if let Some(status) = filter.status {
            self.by_status.get(&status)
        } else if let Some(entity_type) = filter.entity_type {
            self.by_type.get(&entity_type)
        } else {
            let mut all: Vec<_> = self.ops.values().map(|e| (e.seq, e.op.id.clone())).collect();
            all.sort_unstable();
            return all.into_iter().map(|(_, id)| id).collect();
        };

        index
            .map(|ids| ids.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// In-memory [`OperationStore`].
#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    inner: Mutex<Inner>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operations (all statuses).
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("operation store lock poisoned".into()))
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn enqueue(&self, op: SyncOperation) -> Result<OperationId> {
        let mut inner = self.lock()?;
        if inner.ops.contains_key(&op.id) {
            return Err(Error::DuplicateOperation(op.id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let id = op.id.clone();
        let entry = Entry { seq, op };
        inner.index(&entry);
        inner.ops.insert(id.clone(), entry);

        tracing::debug!(operation_id = %id, "Operation enqueued");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        Ok(self.lock()?.ops.get(id).map(|e| e.op.clone()))
    }

    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<SyncOperation>> {
        let mut inner = self.lock()?;
        let Some((_, _, _, id)) = inner.pending.first().cloned() else {
            return Ok(None);
        };

        let op = inner.transition(&id, &StatusChange::in_progress(), now)?;
        tracing::debug!(operation_id = %op.id, priority = op.priority, "Operation dequeued");
        Ok(Some(op))
    }

    async fn update_status(
        &self,
        id: &str,
        change: StatusChange,
        now: Timestamp,
    ) -> Result<SyncOperation> {
        let op = self.lock()?.transition(id, &change, now)?;
        tracing::debug!(operation_id = %op.id, status = %op.status, "Operation status updated");
        Ok(op)
    }

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<SyncOperation>> {
        let inner = self.lock()?;
        let limit = filter.limit.unwrap_or(usize::MAX);

        Ok(inner
            .candidates(filter)
            .iter()
            .filter_map(|id| inner.ops.get(id))
            .map(|e| &e.op)
            .filter(|op| filter.matches(op))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<SyncOperation> {
        let mut inner = self.lock()?;
        let entry = inner
            .ops
            .get(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if !entry.op.is_terminal() {
            return Err(Error::NotTerminal(id.to_string()));
        }

        inner
            .remove_entry(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    async fn remove_completed(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let completed: Vec<OperationId> = inner
            .by_status
            .get(&SyncStatus::Completed)
            .map(|ids| ids.values().cloned().collect())
            .unwrap_or_default();

        for id in &completed {
            inner.remove_entry(id);
        }
        Ok(completed.len())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock()?;
        let mut stats = QueueStats::default();
        for (status, ids) in &inner.by_status {
            stats.add(*status, ids.len());
        }
        Ok(stats)
    }
}
