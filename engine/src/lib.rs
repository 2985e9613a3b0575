//! # Ferry Engine
//!
//! An offline-first sync engine for field-service business data (quotes,
//! clients, sites and supply items).
//!
//! Every local change is written to the local entity store immediately and
//! captured as a durable [`SyncOperation`]. When the network is reachable the
//! engine drains the queue against the remote authority, retries transient
//! failures with exponential backoff and reconciles divergent state through
//! configurable conflict strategies.
//!
//! ## Components
//!
//! - [`Gateway`] - single entry point for mutations (write-through)
//! - [`OperationStore`] - the durable queue, ordered by priority then age
//! - [`Coordinator`] - runs drain cycles and applies conflict verdicts
//! - [`Scheduler`] - decides when a drain runs (tick, reconnect)
//! - [`ConflictResolver`] - classifies and resolves conflicts
//! - [`SyncEngine`] - facade tying the above together
//!
//! ## Operation lifecycle
//!
//! ```text
//! PENDING -> IN_PROGRESS -> COMPLETED
//!                        -> FAILED   -> RETRY_SCHEDULED -> PENDING
//!                        -> CONFLICT -> RETRY_SCHEDULED | COMPLETED | FAILED
//! ```
//!
//! An operation whose `retryCount` reaches `maxRetries` stays FAILED and is
//! never retried automatically.
//!
//! ## Collaborators
//!
//! Persistence, the remote API, reachability and time are traits so the
//! engine runs the same against in-memory stores in tests and SQLite plus
//! HTTP in the agent.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{
//!     Collaborators, ManualClock, MemoryConflictLog, MemoryLocalStore, MemoryOperationStore,
//!     Mutation, ReachabilitySignal, RemoteAck, RemoteApi, RemoteResult, Schema, SyncConfig,
//!     SyncEngine, SyncOperation, SyncStatus, EntityType, OperationFilter,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Accept;
//!
//! #[async_trait::async_trait]
//! impl RemoteApi for Accept {
//!     async fn create(&self, _op: &SyncOperation) -> RemoteResult { Ok(RemoteAck::default()) }
//!     async fn update(&self, _op: &SyncOperation) -> RemoteResult { Ok(RemoteAck::default()) }
//!     async fn delete(&self, _op: &SyncOperation) -> RemoteResult { Ok(RemoteAck::default()) }
//! }
//!
//! # tokio_test_block(async {
//! let engine = SyncEngine::new(
//!     Collaborators {
//!         store: Arc::new(MemoryOperationStore::new()),
//!         local: Arc::new(MemoryLocalStore::new()),
//!         remote: Arc::new(Accept),
//!         conflicts: Arc::new(MemoryConflictLog::new()),
//!         reachability: Arc::new(ReachabilitySignal::new(true)),
//!         comparator: Arc::new(Schema::standard()),
//!         clock: Arc::new(ManualClock::new(1_706_745_600_000)),
//!         write_through: None,
//!     },
//!     SyncConfig::default(),
//! )
//! .unwrap();
//!
//! // Visible locally right away
//! engine
//!     .apply(Mutation::create(EntityType::Client, "c-1", json!({"name": "Acme"})))
//!     .await
//!     .unwrap();
//! assert!(engine.get(EntityType::Client, "c-1").await.unwrap().is_some());
//!
//! let summary = engine.manual_sync().await.unwrap();
//! assert_eq!(summary.succeeded, 1);
//!
//! let ops = engine.operations(&OperationFilter::new()).await.unwrap();
//! assert_eq!(ops[0].status, SyncStatus::Completed);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod gateway;
pub mod history;
pub mod local;
pub mod metrics;
pub mod operation;
pub mod reachability;
pub mod remote;
pub mod scheduler;
pub mod schema;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigPatch, SyncConfig};
pub use conflict::{
    Conflict, ConflictRecord, ConflictResolver, ConflictType, ManualResolution, Resolution,
    ResolutionStrategy, Verdict,
};
pub use coordinator::{Collaborators, Coordinator, DrainSummary};
pub use engine::{EngineStatus, SyncEngine};
pub use entity::Entity;
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent};
pub use gateway::{Gateway, Mutation};
pub use history::{ConflictFilter, ConflictLog, MemoryConflictLog};
pub use local::{CompensatingWrite, LocalStore, MemoryLocalStore, WriteThrough};
pub use metrics::SyncMetrics;
pub use operation::{EntityType, OperationKind, StatusChange, SyncOperation, SyncStatus};
pub use reachability::{Reachability, ReachabilitySignal};
pub use remote::{RemoteAck, RemoteApi, RemoteError, RemoteResult, RemoteVersion};
pub use scheduler::{Scheduler, SchedulerState};
pub use schema::{ConflictComparator, EntitySchema, Schema};
pub use store::{MemoryOperationStore, OperationFilter, OperationStore, QueueStats};

/// Type aliases for clarity
pub type OperationId = String;
pub type EntityId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
/// Higher runs first
pub type Priority = i32;
