//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ferry_engine::{
    Clock, Collaborators, MemoryConflictLog, MemoryLocalStore, MemoryOperationStore,
    ReachabilitySignal, RemoteAck, RemoteApi, RemoteResult, Schema, SyncConfig, SyncEngine,
    SyncOperation, Timestamp,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

pub const EPOCH: Timestamp = 1_706_745_600_000;

/// Wall clock that follows tokio's (possibly paused) time.
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        EPOCH + self.origin.elapsed().as_millis() as u64
    }
}

/// Holds remote calls until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Remote that replays scripted results, then accepts everything.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<RemoteResult>>,
    calls: Mutex<Vec<SyncOperation>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl ScriptedRemote {
    pub fn push(&self, result: RemoteResult) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<SyncOperation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Make every following call wait on the returned gate.
    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn respond(&self, op: &SyncOperation) -> RemoteResult {
        self.calls.lock().unwrap().push(op.clone());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RemoteAck::default()))
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn create(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op).await
    }

    async fn update(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op).await
    }

    async fn delete(&self, op: &SyncOperation) -> RemoteResult {
        self.respond(op).await
    }
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub remote: Arc<ScriptedRemote>,
    pub reachability: Arc<ReachabilitySignal>,
    pub local: Arc<MemoryLocalStore>,
    pub conflicts: Arc<MemoryConflictLog>,
}

impl Harness {
    pub fn new(reachable: bool) -> Self {
        Self::with_config(reachable, test_config())
    }

    pub fn with_config(reachable: bool, config: SyncConfig) -> Self {
        let remote = Arc::new(ScriptedRemote::default());
        let reachability = Arc::new(ReachabilitySignal::new(reachable));
        let local = Arc::new(MemoryLocalStore::new());
        let conflicts = Arc::new(MemoryConflictLog::new());

        let engine = SyncEngine::new(
            Collaborators {
                store: Arc::new(MemoryOperationStore::new()),
                local: local.clone(),
                remote: remote.clone(),
                conflicts: conflicts.clone(),
                reachability: reachability.clone(),
                comparator: Arc::new(Schema::standard()),
                clock: Arc::new(TokioClock::new()),
                write_through: None,
            },
            config,
        )
        .unwrap();

        Self {
            engine: Arc::new(engine),
            remote,
            reachability,
            local,
            conflicts,
        }
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        sync_interval_ms: 30_000,
        retry_delay_ms: 1_000,
        max_retry_delay_ms: 8_000,
        batch_delay_ms: 100,
        reconnect_debounce_ms: 1_500,
        ..Default::default()
    }
}
