//! Write-Through Gateway - the single mutation entry point.
//!
//! A mutation is written to the local entity store first, then captured as a
//! [`SyncOperation`]. The caller gets the local entity back immediately and
//! never waits for the remote. Both writes go through one [`WriteThrough`],
//! so local state never runs ahead of the queue.

use crate::{
    clock::Clock,
    error::Result,
    events::EventBus,
    local::{CompensatingWrite, LocalStore, WriteThrough},
    remote::RemoteVersion,
    store::OperationStore,
    Entity, EntityId, EntityType, Error, OperationKind, Priority, SyncConfig, SyncEvent,
    SyncOperation,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// A requested change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// New entity body; ignored for deletes
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
}

impl Mutation {
    pub fn create(entity_type: EntityType, id: impl Into<EntityId>, payload: Value) -> Self {
        Self {
            kind: OperationKind::Create,
            entity_type,
            entity_id: id.into(),
            payload,
            priority: 0,
        }
    }

    pub fn update(entity_type: EntityType, id: impl Into<EntityId>, payload: Value) -> Self {
        Self {
            kind: OperationKind::Update,
            ..Self::create(entity_type, id, payload)
        }
    }

    pub fn delete(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            kind: OperationKind::Delete,
            ..Self::create(entity_type, id, Value::Null)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

pub struct Gateway {
    writer: Arc<dyn WriteThrough>,
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: watch::Receiver<SyncConfig>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn OperationStore>,
        local: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: watch::Receiver<SyncConfig>,
    ) -> Self {
        Self {
            writer: Arc::new(CompensatingWrite::new(local.clone(), store)),
            local,
            clock,
            events,
            config,
        }
    }

    /// Replace the default put-then-enqueue writer.
    pub fn with_write_through(mut self, writer: Arc<dyn WriteThrough>) -> Self {
        self.writer = writer;
        self
    }

    /// Apply a mutation locally and queue it for the remote.
    pub async fn apply(&self, mutation: Mutation) -> Result<Entity> {
        let now = self.clock.now();
        let previous = self
            .local
            .get(mutation.entity_type, &mutation.entity_id)
            .await?;
        let live = previous.as_ref().filter(|e| e.is_active());

        let (entity, op_payload) = match (mutation.kind, live) {
            (OperationKind::Create, Some(_)) => {
                return Err(Error::EntityExists {
                    entity_type: mutation.entity_type,
                    id: mutation.entity_id,
                });
            }
            (OperationKind::Create, None) => {
                let mut entity = Entity::new(
                    mutation.entity_type,
                    mutation.entity_id.clone(),
                    mutation.payload.clone(),
                    now,
                );
                // Recreating over a tombstone keeps versions increasing
                if let Some(tombstone) = &previous {
                    entity.version = tombstone.version + 1;
                }
                (entity, mutation.payload.clone())
            }
            (OperationKind::Update, Some(current)) => {
                let mut entity = current.clone();
                entity.update_payload(mutation.payload.clone(), now);
                (entity, mutation.payload.clone())
            }
            (OperationKind::Delete, Some(current)) => {
                let mut entity = current.clone();
                entity.mark_deleted(now);
                (entity, current.payload.clone())
            }
            (_, None) => {
                return Err(Error::EntityNotFound {
                    entity_type: mutation.entity_type,
                    id: mutation.entity_id,
                });
            }
        };

        let base_version = live.map(|e| e.version).unwrap_or(0);
        let config = self.config.borrow().clone();
        if !config.sync_enabled {
            self.writer.commit(&entity, previous.as_ref(), None).await?;
            tracing::debug!(
                entity_type = %entity.entity_type,
                entity_id = %entity.id,
                "Sync disabled, mutation kept local"
            );
            return Ok(entity);
        }

        let op = SyncOperation::new(
            mutation.kind,
            mutation.entity_type,
            mutation.entity_id.clone(),
            op_payload,
            now,
        )
        .with_priority(mutation.priority)
        .with_max_retries(config.max_retries)
        .with_base_version(base_version);

        self.writer
            .commit(&entity, previous.as_ref(), Some(&op))
            .await?;

        tracing::debug!(
            operation_id = %op.id,
            kind = %op.kind,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            "Mutation queued"
        );
        self.events.emit(SyncEvent::OperationQueued { operation: op });
        Ok(entity)
    }

    /// Live entity, if any.
    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        Ok(self
            .local
            .get(entity_type, id)
            .await?
            .filter(|e| e.is_active()))
    }

    /// Current local version, tombstones included.
    pub async fn current(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        self.local.get(entity_type, id).await
    }

    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.local.list(entity_type).await
    }

    /// Adopt the remote state locally without queuing anything.
    ///
    /// `None` or a tombstone deletes the local entity.
    pub async fn absorb_remote(
        &self,
        entity_type: EntityType,
        id: &str,
        remote: Option<&RemoteVersion>,
    ) -> Result<Option<Entity>> {
        let now = self.clock.now();
        let previous = self.local.get(entity_type, id).await?;

        let next = match (remote.filter(|r| r.is_live()), previous) {
            (Some(remote), previous) => {
                let version = previous
                    .as_ref()
                    .map(|e| e.version + 1)
                    .unwrap_or(1)
                    .max(remote.version);
                let mut entity = previous.unwrap_or_else(|| {
                    Entity::new(entity_type, id, remote.payload.clone(), remote.updated_at)
                });
                entity.payload = remote.payload.clone();
                entity.version = version;
                entity.updated_at = remote.updated_at;
                entity.deleted = false;
                entity
            }
            (None, Some(mut current)) if current.is_active() => {
                current.mark_deleted(now);
                current
            }
            (None, _) => return Ok(None),
        };

        self.local.put(next.clone()).await?;
        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %id,
            version = next.version,
            deleted = next.deleted,
            "Remote state applied locally"
        );
        Ok(Some(next))
    }

    /// Overwrite the local payload with a resolved one, without queuing.
    pub async fn refresh_local(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: Value,
    ) -> Result<Entity> {
        let now = self.clock.now();
        let entity = match self.local.get(entity_type, id).await? {
            Some(mut current) => {
                current.update_payload(payload, now);
                current.deleted = false;
                current
            }
            None => Entity::new(entity_type, id, payload, now),
        };
        self.local.put(entity.clone()).await?;
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock, local::MemoryLocalStore, store::MemoryOperationStore, OperationFilter,
        StatusChange, SyncStatus, Timestamp,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixture {
        gateway: Gateway,
        store: Arc<MemoryOperationStore>,
        local: Arc<MemoryLocalStore>,
        clock: Arc<ManualClock>,
        config: watch::Sender<SyncConfig>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryOperationStore::new());
        let local = Arc::new(MemoryLocalStore::new());
        let clock = Arc::new(ManualClock::new(1000));
        let (config, config_rx) = watch::channel(SyncConfig::default());
        let gateway = Gateway::new(
            store.clone(),
            local.clone(),
            clock.clone(),
            EventBus::new(),
            config_rx,
        );
        Fixture {
            gateway,
            store,
            local,
            clock,
            config,
        }
    }

    #[tokio::test]
    async fn create_writes_locally_and_queues() {
        let f = fixture();
        let entity = f
            .gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({"name": "Acme"})).with_priority(2))
            .await
            .unwrap();

        assert_eq!(entity.version, 1);
        assert_eq!(
            f.gateway.get(EntityType::Client, "c-1").await.unwrap(),
            Some(entity)
        );

        let ops = f.store.query(&OperationFilter::new()).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].status, SyncStatus::Pending);
        assert_eq!(ops[0].priority, 2);
        assert_eq!(ops[0].base_version, 0);
        assert_eq!(ops[0].max_retries, 3);
    }

    #[tokio::test]
    async fn update_and_delete_track_versions() {
        let f = fixture();
        f.gateway
            .apply(Mutation::create(EntityType::Site, "s-1", json!({"name": "A"})))
            .await
            .unwrap();
        f.clock.advance(10);
        let updated = f
            .gateway
            .apply(Mutation::update(EntityType::Site, "s-1", json!({"name": "B"})))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.updated_at, 1010);

        let deleted = f
            .gateway
            .apply(Mutation::delete(EntityType::Site, "s-1"))
            .await
            .unwrap();
        assert!(deleted.deleted);
        assert!(f.gateway.get(EntityType::Site, "s-1").await.unwrap().is_none());
        assert!(f.gateway.current(EntityType::Site, "s-1").await.unwrap().is_some());

        let ops = f.store.query(&OperationFilter::new()).await.unwrap();
        let bases: Vec<_> = ops.iter().map(|o| (o.kind, o.base_version)).collect();
        assert_eq!(
            bases,
            vec![
                (OperationKind::Create, 0),
                (OperationKind::Update, 1),
                (OperationKind::Delete, 2)
            ]
        );
        // Delete carries the last snapshot
        assert_eq!(ops[2].payload, json!({"name": "B"}));
    }

    #[tokio::test]
    async fn existence_checks() {
        let f = fixture();
        let err = f
            .gateway
            .apply(Mutation::update(EntityType::Quote, "q-1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));

        f.gateway
            .apply(Mutation::create(EntityType::Quote, "q-1", json!({})))
            .await
            .unwrap();
        let err = f
            .gateway
            .apply(Mutation::create(EntityType::Quote, "q-1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityExists { .. }));
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn recreate_over_tombstone() {
        let f = fixture();
        f.gateway
            .apply(Mutation::create(EntityType::Quote, "q-1", json!({})))
            .await
            .unwrap();
        f.gateway
            .apply(Mutation::delete(EntityType::Quote, "q-1"))
            .await
            .unwrap();
        let again = f
            .gateway
            .apply(Mutation::create(EntityType::Quote, "q-1", json!({"v": 2})))
            .await
            .unwrap();
        assert_eq!(again.version, 3);
        assert!(again.is_active());
    }

    #[tokio::test]
    async fn sync_disabled_keeps_mutation_local() {
        let f = fixture();
        f.config.send_modify(|c| c.sync_enabled = false);

        f.gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({})))
            .await
            .unwrap();
        assert!(f.local.get(EntityType::Client, "c-1").await.unwrap().is_some());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn emits_operation_queued() {
        let f = fixture();
        let mut rx = f.gateway.events.subscribe();
        f.gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({})))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            SyncEvent::OperationQueued { operation } => assert_eq!(operation.entity_id, "c-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl OperationStore for BrokenStore {
        async fn enqueue(&self, _op: SyncOperation) -> Result<String> {
            Err(Error::Storage("disk full".into()))
        }
        async fn get(&self, _id: &str) -> Result<Option<SyncOperation>> {
            Ok(None)
        }
        async fn dequeue_next(&self, _now: Timestamp) -> Result<Option<SyncOperation>> {
            Ok(None)
        }
        async fn update_status(
            &self,
            id: &str,
            _change: StatusChange,
            _now: Timestamp,
        ) -> Result<SyncOperation> {
            Err(Error::OperationNotFound(id.into()))
        }
        async fn query(&self, _filter: &OperationFilter) -> Result<Vec<SyncOperation>> {
            Ok(Vec::new())
        }
        async fn remove(&self, id: &str) -> Result<SyncOperation> {
            Err(Error::OperationNotFound(id.into()))
        }
        async fn remove_completed(&self) -> Result<usize> {
            Ok(0)
        }
        async fn stats(&self) -> Result<crate::QueueStats> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn failed_enqueue_rolls_back() {
        let local = Arc::new(MemoryLocalStore::new());
        let (_config, config_rx) = watch::channel(SyncConfig::default());
        let gateway = Gateway::new(
            Arc::new(BrokenStore),
            local.clone(),
            Arc::new(ManualClock::new(0)),
            EventBus::new(),
            config_rx,
        );

        let original = Entity::new(EntityType::Client, "c-1", json!({"name": "Old"}), 0);
        local.put(original.clone()).await.unwrap();

        let err = gateway
            .apply(Mutation::update(EntityType::Client, "c-1", json!({"name": "New"})))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(local.get(EntityType::Client, "c-1").await.unwrap(), Some(original));

        let err = gateway
            .apply(Mutation::create(EntityType::Client, "c-2", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert!(local.get(EntityType::Client, "c-2").await.unwrap().is_none());
    }

    /// Local store whose undo path is broken.
    struct NoRemove(MemoryLocalStore);

    #[async_trait]
    impl LocalStore for NoRemove {
        async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
            self.0.get(entity_type, id).await
        }
        async fn put(&self, entity: Entity) -> Result<()> {
            self.0.put(entity).await
        }
        async fn remove(&self, _entity_type: EntityType, _id: &str) -> Result<()> {
            Err(Error::Storage("read-only".into()))
        }
        async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
            self.0.list(entity_type).await
        }
    }

    #[tokio::test]
    async fn failed_rollback_is_reported() {
        let (_config, config_rx) = watch::channel(SyncConfig::default());
        let gateway = Gateway::new(
            Arc::new(BrokenStore),
            Arc::new(NoRemove(MemoryLocalStore::new())),
            Arc::new(ManualClock::new(0)),
            EventBus::new(),
            config_rx,
        );

        let err = gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        let message = err.to_string();
        assert!(message.contains("disk full"), "{message}");
        assert!(message.contains("not rolled back"), "{message}");
    }

    /// Writer that records commits and can refuse them.
    #[derive(Default)]
    struct RecordingWriter {
        commits: std::sync::Mutex<Vec<(Entity, Option<SyncOperation>)>>,
        refuse: bool,
    }

    #[async_trait]
    impl WriteThrough for RecordingWriter {
        async fn commit(
            &self,
            entity: &Entity,
            _previous: Option<&Entity>,
            op: Option<&SyncOperation>,
        ) -> Result<()> {
            if self.refuse {
                return Err(Error::Storage("transaction aborted".into()));
            }
            self.commits
                .lock()
                .unwrap()
                .push((entity.clone(), op.cloned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn entity_and_operation_share_one_commit() {
        let f = fixture();
        let writer = Arc::new(RecordingWriter::default());
        let gateway = Gateway::new(
            f.store.clone(),
            f.local.clone(),
            f.clock.clone(),
            EventBus::new(),
            f.config.subscribe(),
        )
        .with_write_through(writer.clone());

        gateway
            .apply(Mutation::create(EntityType::Site, "s-1", json!({"name": "A"})))
            .await
            .unwrap();
        f.config.send_modify(|c| c.sync_enabled = false);
        f.local
            .put(Entity::new(EntityType::Site, "s-2", json!({}), 0))
            .await
            .unwrap();
        gateway
            .apply(Mutation::delete(EntityType::Site, "s-2"))
            .await
            .unwrap();

        let commits = writer.commits.lock().unwrap();
        assert_eq!(commits.len(), 2);
        let (entity, op) = &commits[0];
        assert_eq!(entity.id, "s-1");
        assert_eq!(op.as_ref().map(|op| op.kind), Some(OperationKind::Create));
        // Sync disabled commits the entity alone
        assert!(commits[1].0.deleted);
        assert!(commits[1].1.is_none());
        // Nothing bypassed the writer
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn refused_commit_emits_nothing() {
        let f = fixture();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let gateway = Gateway::new(
            f.store.clone(),
            f.local.clone(),
            f.clock.clone(),
            events,
            f.config.subscribe(),
        )
        .with_write_through(Arc::new(RecordingWriter {
            refuse: true,
            ..Default::default()
        }));

        let err = gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert!(f.local.get(EntityType::Client, "c-1").await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn absorb_remote_state() {
        let f = fixture();
        f.gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({"name": "L"})))
            .await
            .unwrap();

        let remote = RemoteVersion::live(json!({"name": "R"}), 7, 555);
        let entity = f
            .gateway
            .absorb_remote(EntityType::Client, "c-1", Some(&remote))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.payload, json!({"name": "R"}));
        assert_eq!(entity.version, 7);
        assert_eq!(entity.updated_at, 555);

        let tombstone = RemoteVersion::tombstone(8, 600);
        let entity = f
            .gateway
            .absorb_remote(EntityType::Client, "c-1", Some(&tombstone))
            .await
            .unwrap()
            .unwrap();
        assert!(entity.deleted);

        // Nothing queued by absorbing
        assert_eq!(f.store.len(), 1);
        // Already gone locally
        assert!(f
            .gateway
            .absorb_remote(EntityType::Client, "c-1", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn refresh_local_bumps_version() {
        let f = fixture();
        f.gateway
            .apply(Mutation::create(EntityType::Client, "c-1", json!({"name": "L"})))
            .await
            .unwrap();
        let entity = f
            .gateway
            .refresh_local(EntityType::Client, "c-1", json!({"name": "M"}))
            .await
            .unwrap();
        assert_eq!(entity.version, 2);
        assert_eq!(entity.payload, json!({"name": "M"}));
        assert_eq!(f.store.len(), 1);
    }
}
