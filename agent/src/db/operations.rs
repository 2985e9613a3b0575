//! SQLite-backed operation queue.

use async_trait::async_trait;
use ferry_engine::{
    Error, OperationFilter, OperationId, OperationStore, QueueStats, StatusChange, SyncOperation,
    SyncStatus, Timestamp,
};
use sqlx::types::Json;
use sqlx::{Executor, QueryBuilder, Sqlite, SqlitePool};

use super::pool::storage_error;

type Result<T> = ferry_engine::Result<T>;

/// A stored operation row from the database.
#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    seq: i64,
    id: String,
    kind: String,
    entity_type: String,
    entity_id: String,
    payload: Json<serde_json::Value>,
    base_version: i64,
    status: String,
    priority: i32,
    retry_count: i64,
    max_retries: i64,
    created_at: i64,
    updated_at: i64,
    last_attempt_at: Option<i64>,
    next_retry_at: Option<i64>,
    error_message: Option<String>,
    conflict_detail: Option<String>,
}

impl OperationRow {
    fn into_operation(self) -> Result<SyncOperation> {
        Ok(SyncOperation {
            id: self.id,
            kind: self.kind.parse()?,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            payload: self.payload.0,
            base_version: self.base_version as u64,
            status: self.status.parse()?,
            priority: self.priority,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
            last_attempt_at: self.last_attempt_at.map(|t| t as u64),
            next_retry_at: self.next_retry_at.map(|t| t as u64),
            error_message: self.error_message,
            conflict_detail: self.conflict_detail,
        })
    }
}

fn into_operations(mut rows: Vec<OperationRow>) -> Result<Vec<SyncOperation>> {
    rows.sort_by_key(|row| row.seq);
    rows.into_iter().map(OperationRow::into_operation).collect()
}

/// Insert a new queue row on any executor, a pool or an open transaction.
pub(super) async fn insert_operation<'e, E>(executor: E, op: &SyncOperation) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO sync_operations (
            id, kind, entity_type, entity_id, payload, base_version, status,
            priority, retry_count, max_retries, created_at, updated_at,
            last_attempt_at, next_retry_at, error_message, conflict_detail
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&op.id)
    .bind(op.kind.as_str())
    .bind(op.entity_type.as_str())
    .bind(&op.entity_id)
    .bind(Json(&op.payload))
    .bind(op.base_version as i64)
    .bind(op.status.as_str())
    .bind(op.priority)
    .bind(op.retry_count as i64)
    .bind(op.max_retries as i64)
    .bind(op.created_at as i64)
    .bind(op.updated_at as i64)
    .bind(op.last_attempt_at.map(|t| t as i64))
    .bind(op.next_retry_at.map(|t| t as i64))
    .bind(&op.error_message)
    .bind(&op.conflict_detail)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(Error::DuplicateOperation(op.id.clone()))
        }
        Err(e) => Err(storage_error(e)),
    }
}

/// [`OperationStore`] persisted in the `sync_operations` table.
///
/// `seq` breaks ties between operations created in the same millisecond, so
/// the queue stays FIFO within a priority.
#[derive(Debug, Clone)]
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &str) -> Result<Option<OperationRow>> {
        sqlx::query_as("SELECT * FROM sync_operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn enqueue(&self, op: SyncOperation) -> Result<OperationId> {
        insert_operation(&self.pool, &op).await?;
        tracing::debug!(operation_id = %op.id, "Operation enqueued");
        Ok(op.id)
    }

    async fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.fetch(id)
            .await?
            .map(OperationRow::into_operation)
            .transpose()
    }

    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<SyncOperation>> {
        // One statement, so two callers can never take the same row
        let row: Option<OperationRow> = sqlx::query_as(
            r#"
            UPDATE sync_operations
            SET status = 'IN_PROGRESS', last_attempt_at = ?, updated_at = ?,
                error_message = NULL, conflict_detail = NULL
            WHERE id = (
                SELECT id FROM sync_operations
                WHERE status = 'PENDING'
                ORDER BY priority DESC, created_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now as i64)
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        let op = row.map(OperationRow::into_operation).transpose()?;
        if let Some(op) = &op {
            tracing::debug!(operation_id = %op.id, priority = op.priority, "Operation dequeued");
        }
        Ok(op)
    }

    async fn update_status(
        &self,
        id: &str,
        change: StatusChange,
        now: Timestamp,
    ) -> Result<SyncOperation> {
        // Take the write lock before reading; a deferred read cannot upgrade
        // while another writer holds it
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(storage_error)?;

        let row: OperationRow = sqlx::query_as("SELECT * FROM sync_operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

        let mut op = row.into_operation()?;
        let previous = op.status;
        op.apply_change(&change, now)?;

        let updated = sqlx::query(
            r#"
            UPDATE sync_operations
            SET kind = ?, payload = ?, status = ?, retry_count = ?, updated_at = ?,
                last_attempt_at = ?, next_retry_at = ?, error_message = ?, conflict_detail = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(op.kind.as_str())
        .bind(Json(&op.payload))
        .bind(op.status.as_str())
        .bind(op.retry_count as i64)
        .bind(op.updated_at as i64)
        .bind(op.last_attempt_at.map(|t| t as i64))
        .bind(op.next_retry_at.map(|t| t as i64))
        .bind(&op.error_message)
        .bind(&op.conflict_detail)
        .bind(id)
        .bind(previous.as_str())
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        if updated.rows_affected() != 1 {
            return Err(Error::Storage(format!(
                "operation {id} changed status concurrently"
            )));
        }
        tx.commit().await.map_err(storage_error)?;

        tracing::debug!(operation_id = %op.id, status = %op.status, "Operation status updated");
        Ok(op)
    }

    async fn query(&self, filter: &OperationFilter) -> Result<Vec<SyncOperation>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM sync_operations WHERE 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(entity_type) = filter.entity_type {
            qb.push(" AND entity_type = ").push_bind(entity_type.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            qb.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        qb.push(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<OperationRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        into_operations(rows)
    }

    async fn remove(&self, id: &str) -> Result<SyncOperation> {
        let op = self
            .get(id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if !op.is_terminal() {
            return Err(Error::NotTerminal(id.to_string()));
        }

        let deleted = sqlx::query("DELETE FROM sync_operations WHERE id = ? AND status = ?")
            .bind(id)
            .bind(op.status.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        if deleted.rows_affected() == 0 {
            return Err(Error::OperationNotFound(id.to_string()));
        }

        tracing::debug!(operation_id = %id, "Operation cleared");
        Ok(op)
    }

    async fn remove_completed(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM sync_operations WHERE status = 'COMPLETED'")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_operations GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            stats.add(status.parse::<SyncStatus>()?, count as usize);
        }
        Ok(stats)
    }

    async fn promote_due(&self, now: Timestamp) -> Result<Vec<SyncOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            r#"
            UPDATE sync_operations
            SET status = 'PENDING', next_retry_at = NULL, updated_at = ?,
                error_message = NULL, conflict_detail = NULL
            WHERE status = 'RETRY_SCHEDULED' AND COALESCE(next_retry_at, 0) <= ?
            RETURNING *
            "#,
        )
        .bind(now as i64)
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let promoted = into_operations(rows)?;
        if !promoted.is_empty() {
            tracing::debug!(count = promoted.len(), "Promoted due retries");
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{file_pool, memory_pool};
    use ferry_engine::{EntityType, OperationKind};
    use serde_json::json;

    fn op(id: &str, priority: i32, created_at: Timestamp) -> SyncOperation {
        SyncOperation::new(
            OperationKind::Update,
            EntityType::Quote,
            format!("quote-{id}"),
            json!({"total": 10}),
            created_at,
        )
        .with_id(id)
        .with_priority(priority)
    }

    async fn store() -> SqliteOperationStore {
        SqliteOperationStore::new(memory_pool().await)
    }

    #[tokio::test]
    async fn enqueue_and_get_round_trip() {
        let store = store().await;
        let original = op("op-1", 2, 100).with_base_version(4);
        store.enqueue(original.clone()).await.unwrap();

        let loaded = store.get("op-1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let store = store().await;
        store.enqueue(op("op-1", 0, 100)).await.unwrap();
        let err = store.enqueue(op("op-1", 0, 200)).await.unwrap_err();
        assert_eq!(err, Error::DuplicateOperation("op-1".into()));
    }

    #[tokio::test]
    async fn dequeue_by_priority_then_age_then_insertion() {
        let store = store().await;
        store.enqueue(op("low", 0, 100)).await.unwrap();
        store.enqueue(op("same-ms-a", 5, 200)).await.unwrap();
        store.enqueue(op("same-ms-b", 5, 200)).await.unwrap();
        store.enqueue(op("older-high", 5, 150)).await.unwrap();

        let mut order = Vec::new();
        while let Some(next) = store.dequeue_next(1_000).await.unwrap() {
            assert_eq!(next.status, SyncStatus::InProgress);
            assert_eq!(next.last_attempt_at, Some(1_000));
            order.push(next.id);
        }
        assert_eq!(order, vec!["older-high", "same-ms-a", "same-ms-b", "low"]);
    }

    #[tokio::test]
    async fn concurrent_dequeue_hands_out_each_operation_once() {
        let store = store().await;
        for i in 0..20 {
            store.enqueue(op(&format!("op-{i}"), 0, i)).await.unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some(op) = store.dequeue_next(500).await.unwrap() {
                        taken.push(op.id);
                    }
                    taken
                })
            })
            .collect();

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn update_status_applies_transition_rules() {
        let store = store().await;
        store.enqueue(op("op-1", 0, 100)).await.unwrap();

        let err = store
            .update_status("op-1", StatusChange::completed(), 200)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        store.dequeue_next(200).await.unwrap();
        let failed = store
            .update_status("op-1", StatusChange::failed("timeout"), 300)
            .await
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));

        let scheduled = store
            .update_status("op-1", StatusChange::retry_at(1_300), 300)
            .await
            .unwrap();
        assert_eq!(scheduled.next_retry_at, Some(1_300));

        let stored = store.get("op-1").await.unwrap().unwrap();
        assert_eq!(stored, scheduled);

        let err = store
            .update_status("missing", StatusChange::pending(), 300)
            .await
            .unwrap_err();
        assert_eq!(err, Error::OperationNotFound("missing".into()));
    }

    #[tokio::test]
    async fn resolution_rewrites_kind_and_payload() {
        let store = store().await;
        store.enqueue(op("op-1", 0, 100)).await.unwrap();
        store.dequeue_next(200).await.unwrap();
        store
            .update_status("op-1", StatusChange::conflict("remote deleted"), 300)
            .await
            .unwrap();

        let change = StatusChange::retry_at(300)
            .with_kind(OperationKind::Create)
            .with_payload(json!({"total": 12}));
        store.update_status("op-1", change, 300).await.unwrap();

        let stored = store.get("op-1").await.unwrap().unwrap();
        assert_eq!(stored.kind, OperationKind::Create);
        assert_eq!(stored.payload, json!({"total": 12}));
    }

    #[tokio::test]
    async fn promote_due_only_moves_due_retries() {
        let store = store().await;
        for (id, retry_at) in [("due", 500), ("later", 5_000)] {
            store.enqueue(op(id, 0, 100)).await.unwrap();
            store.dequeue_next(200).await.unwrap();
            store
                .update_status(id, StatusChange::failed("boom"), 200)
                .await
                .unwrap();
            store
                .update_status(id, StatusChange::retry_at(retry_at), 200)
                .await
                .unwrap();
        }

        let promoted = store.promote_due(1_000).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "due");
        assert_eq!(promoted[0].status, SyncStatus::Pending);
        assert_eq!(promoted[0].next_retry_at, None);
        assert_eq!(promoted[0].retry_count, 1);

        let later = store.get("later").await.unwrap().unwrap();
        assert_eq!(later.status, SyncStatus::RetryScheduled);
    }

    #[tokio::test]
    async fn query_filters_and_limits() {
        let store = store().await;
        store.enqueue(op("a", 0, 100)).await.unwrap();
        store.enqueue(op("b", 0, 101)).await.unwrap();
        store
            .enqueue(
                SyncOperation::new(
                    OperationKind::Create,
                    EntityType::Client,
                    "client-1",
                    json!({}),
                    102,
                )
                .with_id("c"),
            )
            .await
            .unwrap();
        store.dequeue_next(200).await.unwrap();

        let pending = store
            .query(&OperationFilter::new().status(SyncStatus::Pending))
            .await
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let clients = store
            .query(&OperationFilter::new().entity_type(EntityType::Client))
            .await
            .unwrap();
        assert_eq!(clients.len(), 1);

        let by_entity = store
            .query(&OperationFilter::new().entity_id("quote-a"))
            .await
            .unwrap();
        assert_eq!(by_entity[0].id, "a");

        let limited = store.query(&OperationFilter::new().limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "a");
    }

    #[tokio::test]
    async fn stats_and_cleanup() {
        let store = store().await;
        store.enqueue(op("done", 0, 100)).await.unwrap();
        store.enqueue(op("waiting", 0, 200)).await.unwrap();
        store.dequeue_next(300).await.unwrap();
        store
            .update_status("done", StatusChange::completed(), 300)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);

        let err = store.remove("waiting").await.unwrap_err();
        assert_eq!(err, Error::NotTerminal("waiting".into()));

        assert_eq!(store.remove_completed().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn remove_exhausted_failure() {
        let store = store().await;
        store
            .enqueue(op("op-1", 0, 100).with_max_retries(1))
            .await
            .unwrap();
        store.dequeue_next(200).await.unwrap();
        store
            .update_status("op-1", StatusChange::failed("bad request").exhausted(), 200)
            .await
            .unwrap();

        let removed = store.remove("op-1").await.unwrap();
        assert!(removed.is_terminal());
        assert!(store.get("op-1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_status_updates_wait_for_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOperationStore::new(file_pool(dir.path()).await);
        for i in 0..40 {
            store.enqueue(op(&format!("op-{i}"), 0, i)).await.unwrap();
        }
        while store.dequeue_next(500).await.unwrap().is_some() {}

        let updates: Vec<_> = (0..40)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update_status(&format!("op-{i}"), StatusChange::failed("timeout"), 600)
                        .await
                })
            })
            .collect();
        for update in updates {
            let op = update.await.unwrap().unwrap();
            assert_eq!(op.status, SyncStatus::Failed);
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 40);
        assert_eq!(stats.in_progress, 0);
    }
}
