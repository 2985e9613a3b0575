//! SQLite-backed local entity store.

use async_trait::async_trait;
use ferry_engine::{Entity, EntityType, LocalStore};
use sqlx::types::Json;
use sqlx::{Executor, Sqlite, SqlitePool};

use super::pool::storage_error;

type Result<T> = ferry_engine::Result<T>;

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    entity_type: String,
    id: String,
    version: i64,
    payload: Json<serde_json::Value>,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
}

impl EntityRow {
    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            id: self.id,
            entity_type: self.entity_type.parse()?,
            version: self.version as u64,
            payload: self.payload.0,
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
            deleted: self.deleted,
        })
    }
}

/// Insert or replace an entity row on any executor.
pub(super) async fn upsert_entity<'e, E>(executor: E, entity: &Entity) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO entities (entity_type, id, version, payload, created_at, updated_at, deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (entity_type, id) DO UPDATE SET
            version = excluded.version,
            payload = excluded.payload,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(&entity.id)
    .bind(entity.version as i64)
    .bind(Json(&entity.payload))
    .bind(entity.created_at as i64)
    .bind(entity.updated_at as i64)
    .bind(entity.deleted)
    .execute(executor)
    .await
    .map_err(storage_error)?;
    Ok(())
}

/// [`LocalStore`] persisted in the `entities` table, keyed by type and id.
#[derive(Debug, Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT * FROM entities WHERE entity_type = ? AND id = ?")
                .bind(entity_type.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn put(&self, entity: Entity) -> Result<()> {
        upsert_entity(&self.pool, &entity).await
    }

    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM entities WHERE entity_type = ? AND id = ?")
            .bind(entity_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entities WHERE entity_type = ? AND deleted = 0 ORDER BY id",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }
}
