//! Entity write and queue insert in one SQLite transaction.

use async_trait::async_trait;
use ferry_engine::{Entity, SyncOperation, WriteThrough};
use sqlx::SqlitePool;

use super::entities::upsert_entity;
use super::operations::insert_operation;
use super::pool::storage_error;

type Result<T> = ferry_engine::Result<T>;

/// [`WriteThrough`] over the pool shared by the entity and queue tables.
#[derive(Debug, Clone)]
pub struct SqliteWriteThrough {
    pool: SqlitePool,
}

impl SqliteWriteThrough {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WriteThrough for SqliteWriteThrough {
    async fn commit(
        &self,
        entity: &Entity,
        _previous: Option<&Entity>,
        op: Option<&SyncOperation>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(storage_error)?;

        // Dropping the transaction on any error rolls both writes back
        upsert_entity(&mut *tx, entity).await?;
        if let Some(op) = op {
            insert_operation(&mut *tx, op).await?;
        }
        tx.commit().await.map_err(storage_error)?;

        tracing::debug!(
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            queued = op.is_some(),
            "Local write committed"
        );
        Ok(())
    }
}
