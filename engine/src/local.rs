//! Local entity store collaborator.
//!
//! A key-by-id record store. Deletions made through the gateway are kept as
//! tombstones so the conflict resolver can still see when and what was deleted;
//! [`LocalStore::remove`] is only used to undo a write that never got queued.
//!
//! [`WriteThrough`] is the seam the gateway writes through: an entity and the
//! operation that captures it land together or not at all. Backends that keep
//! both in one database commit them in a single transaction; anything else
//! goes through [`CompensatingWrite`].

use crate::{error::Result, store::OperationStore, Entity, EntityType, Error, SyncOperation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Current entity, tombstones included.
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>>;

    /// Insert or replace an entity.
    async fn put(&self, entity: Entity) -> Result<()>;

    /// Forget an entity entirely.
    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<()>;

    /// Live (non-deleted) entities of one type.
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>>;
}

#[async_trait]
pub trait WriteThrough: Send + Sync {
    /// Store `entity` and, when given, enqueue `op` as one unit.
    ///
    /// On error neither is visible; `previous` is the state to restore.
    async fn commit(
        &self,
        entity: &Entity,
        previous: Option<&Entity>,
        op: Option<&SyncOperation>,
    ) -> Result<()>;
}

/// [`WriteThrough`] over two independent stores.
///
/// Writes the entity, then enqueues, and undoes the write when the enqueue
/// fails. A failed undo is reported in the returned error.
pub struct CompensatingWrite {
    local: Arc<dyn LocalStore>,
    store: Arc<dyn OperationStore>,
}

impl CompensatingWrite {
    pub fn new(local: Arc<dyn LocalStore>, store: Arc<dyn OperationStore>) -> Self {
        Self { local, store }
    }
}

#[async_trait]
impl WriteThrough for CompensatingWrite {
    async fn commit(
        &self,
        entity: &Entity,
        previous: Option<&Entity>,
        op: Option<&SyncOperation>,
    ) -> Result<()> {
        self.local.put(entity.clone()).await?;
        let Some(op) = op else {
            return Ok(());
        };
        let Err(err) = self.store.enqueue(op.clone()).await else {
            return Ok(());
        };

        tracing::error!(
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            error = %err,
            "Failed to queue mutation, rolling back local write"
        );
        let restored = match previous {
            Some(previous) => self.local.put(previous.clone()).await,
            None => self.local.remove(entity.entity_type, &entity.id).await,
        };
        match restored {
            Ok(()) => Err(err),
            Err(rollback) => {
                tracing::error!(
                    entity_type = %entity.entity_type,
                    entity_id = %entity.id,
                    error = %rollback,
                    "Rollback of local write failed"
                );
                Err(Error::Storage(format!(
                    "{err}; local write to {}/{} not rolled back: {rollback}",
                    entity.entity_type, entity.id
                )))
            }
        }
    }
}

/// In-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: Mutex<HashMap<(EntityType, String), Entity>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(EntityType, String), Entity>>> {
        self.entities
            .lock()
            .map_err(|_| Error::Storage("local store lock poisoned".into()))
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        Ok(self.lock()?.get(&(entity_type, id.to_string())).cloned())
    }

    async fn put(&self, entity: Entity) -> Result<()> {
        self.lock()?
            .insert((entity.entity_type, entity.id.clone()), entity);
        Ok(())
    }

    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.lock()?.remove(&(entity_type, id.to_string()));
        Ok(())
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        let mut entities: Vec<Entity> = self
            .lock()?
            .values()
            .filter(|e| e.entity_type == entity_type && e.is_active())
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemoryLocalStore::new();
        let entity = Entity::new(EntityType::Client, "c-1", json!({"name": "Acme"}), 1);
        store.put(entity.clone()).await.unwrap();

        assert_eq!(store.get(EntityType::Client, "c-1").await.unwrap(), Some(entity));
        // Same id under another type is a different entity
        assert!(store.get(EntityType::Site, "c-1").await.unwrap().is_none());

        store.remove(EntityType::Client, "c-1").await.unwrap();
        assert!(store.get(EntityType::Client, "c-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_tombstones() {
        let store = MemoryLocalStore::new();
        let mut gone = Entity::new(EntityType::Quote, "q-2", json!({}), 1);
        gone.mark_deleted(2);
        store.put(gone).await.unwrap();
        store
            .put(Entity::new(EntityType::Quote, "q-1", json!({}), 1))
            .await
            .unwrap();
        store
            .put(Entity::new(EntityType::Site, "s-1", json!({}), 1))
            .await
            .unwrap();

        let quotes = store.list(EntityType::Quote).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].id, "q-1");
    }
}
