//! The public face of the engine.
//!
//! [`SyncEngine`] wires the gateway, coordinator and scheduler around one set
//! of [`Collaborators`] and exposes the operations a UI or control plane
//! needs: mutate entities, start and stop background sync, trigger a drain,
//! inspect the queue and work through conflicts.

use crate::{
    conflict::{ConflictRecord, ManualResolution},
    coordinator::{Collaborators, Coordinator, DrainSummary},
    error::Result,
    events::EventBus,
    gateway::{Gateway, Mutation},
    history::{ConflictFilter, ConflictLog},
    reachability::Reachability,
    scheduler::{Scheduler, SchedulerState},
    store::{OperationFilter, OperationStore, QueueStats},
    ConfigPatch, Entity, EntityType, Error, SyncConfig, SyncEvent, SyncMetrics, SyncOperation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub scheduler: SchedulerState,
    pub reachable: bool,
    /// A drain cycle is running right now
    pub syncing: bool,
    pub queue: QueueStats,
    pub metrics: SyncMetrics,
}

pub struct SyncEngine {
    gateway: Arc<Gateway>,
    coordinator: Arc<Coordinator>,
    scheduler: Scheduler,
    store: Arc<dyn OperationStore>,
    conflicts: Arc<dyn ConflictLog>,
    reachability: Arc<dyn Reachability>,
    events: EventBus,
    config: watch::Sender<SyncConfig>,
}

impl SyncEngine {
    /// Build an engine. The scheduler stays stopped until [`start`](Self::start).
    pub fn new(collaborators: Collaborators, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (config, config_rx) = watch::channel(config);
        let events = EventBus::new();

        let mut gateway = Gateway::new(
            collaborators.store.clone(),
            collaborators.local.clone(),
            collaborators.clock.clone(),
            events.clone(),
            config_rx.clone(),
        );
        if let Some(writer) = collaborators.write_through.clone() {
            gateway = gateway.with_write_through(writer);
        }
        let gateway = Arc::new(gateway);
        let coordinator = Arc::new(Coordinator::new(
            &collaborators,
            gateway.clone(),
            events.clone(),
            config_rx.clone(),
        ));
        let scheduler = Scheduler::new(
            coordinator.clone(),
            collaborators.reachability.clone(),
            events.clone(),
            config_rx,
        );

        Ok(Self {
            gateway,
            coordinator,
            scheduler,
            store: collaborators.store,
            conflicts: collaborators.conflicts,
            reachability: collaborators.reachability,
            events,
            config,
        })
    }

    // Entities

    pub async fn apply(&self, mutation: Mutation) -> Result<Entity> {
        self.gateway.apply(mutation).await
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        self.gateway.get(entity_type, id).await
    }

    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.gateway.list(entity_type).await
    }

    // Lifecycle

    /// Recover interrupted operations and start background sync.
    ///
    /// Returns `false` if the scheduler was already running.
    pub async fn start(&self) -> Result<bool> {
        if self.scheduler.state() == SchedulerState::Running {
            return Ok(false);
        }
        let recovered = self.coordinator.recover_interrupted().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted operations");
        }
        Ok(self.scheduler.start())
    }

    /// Stop background sync. Waits for an in-flight drain to finish.
    pub async fn stop(&self) -> bool {
        self.scheduler.stop().await
    }

    /// Drain now, regardless of the scheduler.
    pub async fn manual_sync(&self) -> Result<DrainSummary> {
        self.coordinator.drain().await
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability.is_reachable()
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            scheduler: self.scheduler.state(),
            reachable: self.is_reachable(),
            syncing: self.coordinator.is_active(),
            queue: self.store.stats().await?,
            metrics: self.metrics().await?,
        })
    }

    pub async fn metrics(&self) -> Result<SyncMetrics> {
        let mut metrics = self.coordinator.metrics();
        metrics.pending_operations = self.store.stats().await?.outstanding() as u64;
        Ok(metrics)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // Configuration

    pub fn config(&self) -> SyncConfig {
        self.config.borrow().clone()
    }

    /// Validate and apply a partial config update. The running scheduler and
    /// the next drain pick it up; on error nothing changes.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<SyncConfig> {
        let mut outcome = Err(Error::InvalidConfig("config unchanged".into()));
        self.config.send_if_modified(|current| match current.apply(patch) {
            Ok(next) => {
                let changed = *current != next;
                *current = next.clone();
                outcome = Ok(next);
                changed
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });

        match &outcome {
            Ok(_) => tracing::info!(?patch, "Config updated"),
            Err(err) => tracing::warn!(error = %err, "Config update rejected"),
        }
        outcome
    }

    // Queue

    pub async fn operations(&self, filter: &OperationFilter) -> Result<Vec<SyncOperation>> {
        self.store.query(filter).await
    }

    pub async fn operation(&self, id: &str) -> Result<SyncOperation> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    pub async fn retry_operation(&self, id: &str) -> Result<SyncOperation> {
        self.coordinator.retry_operation(id).await
    }

    /// Remove one terminal operation from the queue.
    pub async fn clear_operation(&self, id: &str) -> Result<SyncOperation> {
        let removed = self.store.remove(id).await?;
        tracing::info!(operation_id = %id, status = %removed.status, "Operation cleared");
        Ok(removed)
    }

    pub async fn remove_completed(&self) -> Result<usize> {
        let removed = self.store.remove_completed().await?;
        tracing::debug!(removed, "Completed operations removed");
        Ok(removed)
    }

    // Conflicts

    pub async fn conflicts(&self, filter: &ConflictFilter) -> Result<Vec<ConflictRecord>> {
        self.conflicts.query(filter).await
    }

    pub async fn conflict(&self, id: &str) -> Result<ConflictRecord> {
        self.conflicts
            .get(id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: &ManualResolution,
        resolved_by: &str,
    ) -> Result<SyncOperation> {
        self.coordinator
            .resolve_conflict(conflict_id, choice, resolved_by)
            .await
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("scheduler", &self.scheduler.state())
            .field("config", &*self.config.borrow())
            .finish_non_exhaustive()
    }
}
