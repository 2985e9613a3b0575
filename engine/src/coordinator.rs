//! Sync Coordinator - executes drain cycles.
//!
//! # Drain cycle
//!
//! 1. Refuse to start while offline or while another drain is active
//! 2. Until recovery has run once, fail operations a previous process left
//!    IN_PROGRESS
//! 3. Promote due RETRY_SCHEDULED operations back to PENDING
//! 4. Pull batches of up to `batchSize` operations in priority order and
//!    process them one at a time
//! 5. Pause `batchDelayMs` between batches while work remains
//! 6. Fold the outcome into the cumulative metrics and emit an event
//!
//! A failing remote call only affects its own operation. Storage errors end
//! the drain and are returned to the caller.
//!
//! Each operation is attempted at most once per drain: failures are parked in
//! RETRY_SCHEDULED and only promoted at the start of a later drain.

use crate::{
    clock::Clock,
    conflict::{ConflictRecord, ConflictResolver, ManualResolution, Resolution, Verdict},
    error::Result,
    events::EventBus,
    gateway::Gateway,
    history::{ConflictFilter, ConflictLog},
    reachability::Reachability,
    remote::{RemoteApi, RemoteError, RemoteVersion},
    schema::ConflictComparator,
    store::OperationStore,
    Error, OperationKind, ResolutionStrategy, StatusChange, SyncConfig, SyncEvent, SyncMetrics,
    SyncOperation, SyncStatus, Timestamp,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// `resolved_by` value when a conflicted operation is retried by hand.
pub const MANUAL_RETRY: &str = "manual-retry";

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub duration_ms: u64,
    /// Operations sent to the remote
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Conflicts left for manual resolution
    pub deferred: usize,
    pub batches: usize,
}

impl DrainSummary {
    fn record(&mut self, outcome: Outcome) {
        self.attempted += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Conflict { deferred } => {
                self.conflicts += 1;
                if deferred {
                    self.deferred += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Conflict { deferred: bool },
}

/// Collaborators injected into the engine by the composition root.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn OperationStore>,
    pub local: Arc<dyn crate::local::LocalStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub conflicts: Arc<dyn ConflictLog>,
    pub reachability: Arc<dyn Reachability>,
    pub comparator: Arc<dyn ConflictComparator>,
    pub clock: Arc<dyn Clock>,
    /// Atomic entity-plus-operation writer; `None` writes `local` then `store`
    pub write_through: Option<Arc<dyn crate::local::WriteThrough>>,
}

/// Releases the active-drain latch on drop.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Coordinator {
    store: Arc<dyn OperationStore>,
    gateway: Arc<Gateway>,
    remote: Arc<dyn RemoteApi>,
    conflicts: Arc<dyn ConflictLog>,
    reachability: Arc<dyn Reachability>,
    comparator: Arc<dyn ConflictComparator>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: watch::Receiver<SyncConfig>,
    active: AtomicBool,
    /// Interrupted operations have been recovered at least once
    recovered: AtomicBool,
    metrics: Mutex<SyncMetrics>,
}

impl Coordinator {
    pub fn new(
        collaborators: &Collaborators,
        gateway: Arc<Gateway>,
        events: EventBus,
        config: watch::Receiver<SyncConfig>,
    ) -> Self {
        Self {
            store: collaborators.store.clone(),
            gateway,
            remote: collaborators.remote.clone(),
            conflicts: collaborators.conflicts.clone(),
            reachability: collaborators.reachability.clone(),
            comparator: collaborators.comparator.clone(),
            clock: collaborators.clock.clone(),
            events,
            config,
            active: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            metrics: Mutex::new(SyncMetrics::default()),
        }
    }

    /// Whether a drain cycle is running right now.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cumulative metrics, without the queue-derived pending count.
    pub fn metrics(&self) -> SyncMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn try_begin(&self) -> Option<DrainGuard<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(&self.active))
    }

    fn resolver(&self, config: &SyncConfig) -> ConflictResolver {
        ConflictResolver::new(self.comparator.clone())
            .with_concurrent_window(config.concurrent_window_ms)
    }

    /// Run one drain cycle.
    ///
    /// Fails with [`Error::Offline`] when the network is unreachable and with
    /// [`Error::SyncInProgress`] when another drain holds the latch; neither
    /// touches any state.
    pub async fn drain(&self) -> Result<DrainSummary> {
        if !self.reachability.is_reachable() {
            return Err(Error::Offline);
        }
        let _guard = self.try_begin().ok_or(Error::SyncInProgress)?;

        let config = self.config.borrow().clone();
        let started_at = self.clock.now();
        let timer = tokio::time::Instant::now();
        tracing::info!(batch_size = config.batch_size, "Drain started");
        self.events.emit(SyncEvent::SyncStarted { at: started_at });

        match self.run(&config, started_at).await {
            Ok(mut summary) => {
                summary.finished_at = self.clock.now();
                summary.duration_ms = timer.elapsed().as_millis() as u64;

                self.metrics
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record_drain(&summary);

                tracing::info!(
                    attempted = summary.attempted,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    conflicts = summary.conflicts,
                    duration_ms = summary.duration_ms,
                    "Drain completed"
                );
                self.events.emit(SyncEvent::SyncCompleted {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(err) => {
                tracing::error!(error = %err, "Drain aborted");
                self.events.emit(SyncEvent::SyncFailed {
                    error: err.to_string(),
                    at: self.clock.now(),
                });
                Err(err)
            }
        }
    }

    async fn run(&self, config: &SyncConfig, started_at: Timestamp) -> Result<DrainSummary> {
        let mut summary = DrainSummary {
            started_at,
            ..Default::default()
        };

        if !self.recovered.load(Ordering::Acquire) {
            self.recover_stranded(config).await?;
        }

        for op in self.store.promote_due(started_at).await? {
            self.events.emit(SyncEvent::OperationUpdated { operation: op });
        }

        loop {
            let mut taken = 0;
            while taken < config.batch_size {
                let Some(op) = self.store.dequeue_next(self.clock.now()).await? else {
                    break;
                };
                taken += 1;
                let id = op.id.clone();
                self.events.emit(SyncEvent::OperationUpdated {
                    operation: op.clone(),
                });

                match self.process(op, config).await {
                    Ok(outcome) => summary.record(outcome),
                    Err(err) if err.is_storage() => return Err(err),
                    Err(err) => {
                        tracing::error!(operation_id = %id, error = %err, "Operation outcome not recorded");
                        summary.attempted += 1;
                        summary.failed += 1;
                    }
                }
            }

            if taken == 0 {
                break;
            }
            summary.batches += 1;

            if taken < config.batch_size || self.store.stats().await?.pending == 0 {
                break;
            }
            if !self.reachability.is_reachable() {
                tracing::info!("Network lost, ending drain early");
                break;
            }
            tokio::time::sleep(config.batch_delay()).await;
        }

        Ok(summary)
    }

    async fn process(&self, op: SyncOperation, config: &SyncConfig) -> Result<Outcome> {
        let result = AssertUnwindSafe(self.remote.send(&op))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(RemoteError::Transient("remote call panicked".into())));

        match result {
            Ok(ack) => {
                tracing::debug!(
                    operation_id = %op.id,
                    remote_version = ?ack.version,
                    "Operation accepted by remote"
                );
                self.transition(&op.id, StatusChange::completed()).await?;
                Ok(Outcome::Succeeded)
            }
            Err(RemoteError::Transient(message)) => {
                self.fail(&op, message, false, config).await?;
                Ok(Outcome::Failed)
            }
            Err(RemoteError::Permanent(message)) => {
                self.fail(&op, message, true, config).await?;
                Ok(Outcome::Failed)
            }
            Err(RemoteError::Conflict(remote)) => self.handle_conflict(op, remote, config).await,
        }
    }

    async fn transition(&self, id: &str, change: StatusChange) -> Result<SyncOperation> {
        let op = self
            .store
            .update_status(id, change, self.clock.now())
            .await?;
        self.events.emit(SyncEvent::OperationUpdated {
            operation: op.clone(),
        });
        Ok(op)
    }

    /// Record a failed attempt and schedule the next one if budget is left.
    async fn fail(
        &self,
        op: &SyncOperation,
        message: String,
        permanent: bool,
        config: &SyncConfig,
    ) -> Result<SyncOperation> {
        let mut change = StatusChange::failed(message.clone());
        if permanent {
            change = change.exhausted();
        }
        let failed = self.transition(&op.id, change).await?;

        if failed.is_retry_exhausted() {
            tracing::warn!(
                operation_id = %op.id,
                retries = failed.retry_count,
                permanent,
                error = %message,
                "Operation failed permanently"
            );
            return Ok(failed);
        }

        let retry_at = self.clock.now() + config.backoff_ms(failed.retry_count);
        tracing::warn!(
            operation_id = %op.id,
            retry_count = failed.retry_count,
            retry_at,
            error = %message,
            "Operation failed, retry scheduled"
        );
        self.transition(&op.id, StatusChange::retry_at(retry_at))
            .await
    }

    async fn handle_conflict(
        &self,
        op: SyncOperation,
        remote: Option<RemoteVersion>,
        config: &SyncConfig,
    ) -> Result<Outcome> {
        let resolver = self.resolver(config);
        let local = self.gateway.current(op.entity_type, &op.entity_id).await?;

        let Some(conflict) = resolver.detect(&op, local.as_ref(), remote.as_ref()) else {
            tracing::debug!(operation_id = %op.id, "Remote already matches, completing");
            self.transition(&op.id, StatusChange::completed()).await?;
            return Ok(Outcome::Succeeded);
        };

        let conflicted = self
            .transition(&op.id, StatusChange::conflict(conflict.describe()))
            .await?;

        let now = self.clock.now();
        let strategy = config.strategy_for(op.entity_type);
        let resolution = resolver.resolve(&conflict, strategy, now);
        let deferred = resolution.verdict == Verdict::Defer;

        let record = if deferred {
            ConflictRecord::new(&conflicted, &conflict, now)
        } else {
            ConflictRecord::resolved(&conflicted, &conflict, &resolution, now)
        };
        tracing::info!(
            operation_id = %op.id,
            conflict_id = %record.id,
            conflict_type = %conflict.conflict_type,
            strategy = %strategy,
            concurrent = conflict.concurrent,
            deferred,
            "Conflict detected"
        );
        self.conflicts.append(record).await?;

        self.apply_verdict(&conflicted, &resolution.verdict, false)
            .await?;
        Ok(Outcome::Conflict { deferred })
    }

    /// Move a CONFLICT operation on according to a verdict.
    async fn apply_verdict(
        &self,
        op: &SyncOperation,
        verdict: &Verdict,
        reset_retries: bool,
    ) -> Result<SyncOperation> {
        match verdict {
            Verdict::Requeue {
                kind,
                payload,
                refresh_local,
            } => {
                if op.is_retry_exhausted() && !reset_retries {
                    tracing::warn!(operation_id = %op.id, "Conflict retries exhausted");
                    return self
                        .transition(&op.id, StatusChange::failed("conflict retries exhausted"))
                        .await;
                }
                if *refresh_local {
                    if let Some(payload) = payload {
                        self.gateway
                            .refresh_local(op.entity_type, &op.entity_id, payload.clone())
                            .await?;
                    }
                }

                let mut change = StatusChange::retry_at(self.clock.now()).with_kind(*kind);
                if let Some(payload) = payload {
                    change = change.with_payload(payload.clone());
                }
                if reset_retries {
                    change = change.reset_retries();
                }
                self.transition(&op.id, change).await
            }
            Verdict::AcceptRemote { remote } => {
                self.gateway
                    .absorb_remote(op.entity_type, &op.entity_id, remote.as_ref())
                    .await?;
                self.transition(&op.id, StatusChange::completed()).await
            }
            Verdict::Complete => self.transition(&op.id, StatusChange::completed()).await,
            Verdict::Defer => Ok(op.clone()),
        }
    }

    /// Fail operations a previous process left IN_PROGRESS and schedule them
    /// for another attempt.
    ///
    /// IN_PROGRESS operations belong to the running drain while the latch is
    /// held, so recovery is skipped then and the next drain performs it
    /// before dequeuing.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Drain active, recovery deferred to the next drain");
            return Ok(0);
        };
        let config = self.config.borrow().clone();
        self.recover_stranded(&config).await
    }

    /// Caller must hold the drain latch.
    async fn recover_stranded(&self, config: &SyncConfig) -> Result<usize> {
        let stranded = self
            .store
            .query(&crate::OperationFilter::new().status(SyncStatus::InProgress))
            .await?;

        for op in &stranded {
            tracing::warn!(operation_id = %op.id, "Recovering interrupted operation");
            self.fail(op, "interrupted".to_string(), false, config)
                .await?;
        }
        self.recovered.store(true, Ordering::Release);
        Ok(stranded.len())
    }

    /// Put a FAILED or CONFLICT operation back in line with a fresh budget.
    ///
    /// Pending conflict records of the operation are closed in favour of the
    /// local version being retried.
    pub async fn retry_operation(&self, id: &str) -> Result<SyncOperation> {
        let op = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if !matches!(op.status, SyncStatus::Failed | SyncStatus::Conflict) {
            return Err(Error::InvalidTransition {
                id: op.id,
                from: op.status,
                to: SyncStatus::RetryScheduled,
            });
        }

        let now = self.clock.now();
        if op.status == SyncStatus::Conflict {
            let resolution = Resolution {
                strategy: ResolutionStrategy::LocalWins,
                verdict: Verdict::Requeue {
                    kind: op.kind,
                    payload: None,
                    refresh_local: false,
                },
                resolved_payload: (op.kind != OperationKind::Delete).then(|| op.payload.clone()),
            };
            let pending = self
                .conflicts
                .query(&ConflictFilter::pending().operation(id))
                .await?;
            for record in pending {
                self.conflicts
                    .seal(&record.id, &resolution, MANUAL_RETRY, now)
                    .await?;
            }
        }

        let requeued = self.store.requeue(id, now).await?;
        tracing::info!(operation_id = %id, "Operation requeued by hand");
        self.events.emit(SyncEvent::OperationUpdated {
            operation: requeued.clone(),
        });
        Ok(requeued)
    }

    /// Apply a person's decision to a deferred conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: &ManualResolution,
        resolved_by: &str,
    ) -> Result<SyncOperation> {
        let record = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        if !record.is_pending() {
            return Err(Error::ConflictAlreadyResolved(conflict_id.to_string()));
        }

        let op = self
            .store
            .get(&record.operation_id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(record.operation_id.clone()))?;
        if op.status != SyncStatus::Conflict {
            return Err(Error::InvalidTransition {
                id: op.id,
                from: op.status,
                to: SyncStatus::RetryScheduled,
            });
        }

        let config = self.config.borrow().clone();
        let resolution = self
            .resolver(&config)
            .resolve_manual(&record.conflict(), choice);

        self.conflicts
            .seal(conflict_id, &resolution, resolved_by, self.clock.now())
            .await?;
        tracing::info!(
            conflict_id,
            operation_id = %op.id,
            resolved_by,
            strategy = %resolution.strategy,
            "Conflict resolved by hand"
        );

        self.apply_verdict(&op, &resolution.verdict, true).await
    }
}
