//! SQLite-backed conflict history.

use async_trait::async_trait;
use ferry_engine::{ConflictFilter, ConflictLog, ConflictRecord, Error, Resolution, Timestamp};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::pool::storage_error;

type Result<T> = ferry_engine::Result<T>;

/// [`ConflictLog`] persisted in the `conflict_records` table.
///
/// The full record is stored as JSON; the indexed columns only serve lookups.
#[derive(Debug, Clone)]
pub struct SqliteConflictLog {
    pool: SqlitePool,
}

impl SqliteConflictLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConflictLog for SqliteConflictLog {
    async fn append(&self, record: ConflictRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_records (
                id, operation_id, entity_type, entity_id, pending, detected_at, record
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.operation_id)
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(record.is_pending())
        .bind(record.detected_at as i64)
        .bind(Json(&record))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::debug!(
            conflict_id = %record.id,
            operation_id = %record.operation_id,
            conflict_type = %record.conflict_type,
            "Conflict recorded"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let row: Option<(Json<ConflictRecord>,)> =
            sqlx::query_as("SELECT record FROM conflict_records WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(row.map(|(record,)| record.0))
    }

    async fn query(&self, filter: &ConflictFilter) -> Result<Vec<ConflictRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT record FROM conflict_records WHERE 1 = 1");
        if let Some(operation_id) = &filter.operation_id {
            qb.push(" AND operation_id = ").push_bind(operation_id.clone());
        }
        if let Some(entity_type) = filter.entity_type {
            qb.push(" AND entity_type = ").push_bind(entity_type.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            qb.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        if let Some(pending) = filter.pending {
            qb.push(" AND pending = ").push_bind(pending);
        }
        qb.push(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<(Json<ConflictRecord>,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(|(record,)| record.0).collect())
    }

    async fn seal(
        &self,
        id: &str,
        resolution: &Resolution,
        resolved_by: &str,
        now: Timestamp,
    ) -> Result<ConflictRecord> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(storage_error)?;

        let (Json(mut record),): (Json<ConflictRecord>,) =
            sqlx::query_as("SELECT record FROM conflict_records WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_error)?
                .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;

        record.seal(resolution, resolved_by, now)?;

        let updated =
            sqlx::query("UPDATE conflict_records SET record = ?, pending = 0 WHERE id = ? AND pending = 1")
                .bind(Json(&record))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
        if updated.rows_affected() != 1 {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }
        tx.commit().await.map_err(storage_error)?;

        tracing::info!(conflict_id = %id, resolved_by, "Conflict sealed");
        Ok(record)
    }
}
