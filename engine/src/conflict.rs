//! Conflict detection and resolution.
//!
//! When the remote rejects a write, the coordinator hands the operation, the
//! current local entity and the remote-reported version to the
//! [`ConflictResolver`].
//!
//! # Algorithm
//!
//! 1. Classify the divergence from the operation kind and the remote state
//! 2. Drop false alarms (deletes of remote tombstones, updates whose
//!    conflict-significant fields already match)
//! 3. Pick a winner with the configured [`ResolutionStrategy`]
//! 4. Turn the winner into a [`Verdict`] the coordinator can apply

use crate::{
    remote::RemoteVersion, schema::ConflictComparator, Entity, EntityId, EntityType, Error,
    OperationId, OperationKind, SyncOperation, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// `resolved_by` value for automatic resolutions.
pub const AUTO_RESOLVER: &str = "auto";

/// Default width of the window in which two writes count as concurrent.
pub const DEFAULT_CONCURRENT_WINDOW_MS: u64 = 1000;

/// Kind of divergence between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Create against an existing remote record, or update/delete against
    /// none
    CreateConflict,
    /// Both sides updated
    UpdateUpdate,
    /// Local updated, remote deleted
    UpdateDelete,
    /// Local deleted, remote updated
    DeleteUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::CreateConflict => "CREATE_CONFLICT",
            ConflictType::UpdateUpdate => "UPDATE_UPDATE",
            ConflictType::UpdateDelete => "UPDATE_DELETE",
            ConflictType::DeleteUpdate => "DELETE_UPDATE",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "CREATE_CONFLICT" => Ok(ConflictType::CreateConflict),
            "UPDATE_UPDATE" => Ok(ConflictType::UpdateUpdate),
            "UPDATE_DELETE" => Ok(ConflictType::UpdateDelete),
            "DELETE_UPDATE" => Ok(ConflictType::DeleteUpdate),
            other => Err(Error::Unrecognized(format!("conflict type '{other}'"))),
        }
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Later `updatedAt` wins, ties go to the remote (default)
    #[default]
    LastWriteWins,
    LocalWins,
    RemoteWins,
    /// Field-level union, remote takes precedence on overlapping fields
    Merge,
    /// Leave the operation in CONFLICT for a person to decide
    Manual,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 5] = [
        ResolutionStrategy::LastWriteWins,
        ResolutionStrategy::LocalWins,
        ResolutionStrategy::RemoteWins,
        ResolutionStrategy::Merge,
        ResolutionStrategy::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "LAST_WRITE_WINS",
            ResolutionStrategy::LocalWins => "LOCAL_WINS",
            ResolutionStrategy::RemoteWins => "REMOTE_WINS",
            ResolutionStrategy::Merge => "MERGE",
            ResolutionStrategy::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| Error::Unrecognized(format!("resolution strategy '{s}'")))
    }
}

/// A person's decision on a deferred conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualResolution {
    KeepLocal,
    KeepRemote,
    /// Push a hand-edited payload
    Custom(Value),
}

/// A detected divergence, with both sides as they were at detection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_type: ConflictType,
    /// Kind of the operation that hit the conflict
    pub operation_kind: OperationKind,
    pub entity_type: EntityType,
    /// Local payload, `None` when the local side is deleted
    pub local: Option<Value>,
    pub local_updated_at: Timestamp,
    /// Remote state, `None` when the remote has no record
    pub remote: Option<RemoteVersion>,
    pub differing_fields: Vec<String>,
    /// Local and remote writes landed within the concurrency window
    pub concurrent: bool,
}

impl Conflict {
    fn remote_live(&self) -> Option<&RemoteVersion> {
        self.remote.as_ref().filter(|r| r.is_live())
    }

    /// One-line description stored on the operation.
    pub fn describe(&self) -> String {
        if self.differing_fields.is_empty() {
            self.conflict_type.to_string()
        } else {
            format!(
                "{}: {}",
                self.conflict_type,
                self.differing_fields.join(", ")
            )
        }
    }
}

/// What the coordinator should do with a conflicted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Send the operation again, rewritten to `kind` and `payload`
    /// (`None` keeps the current payload).
    Requeue {
        kind: OperationKind,
        payload: Option<Value>,
        /// Also write the payload to the local store
        refresh_local: bool,
    },
    /// Adopt the remote state locally; `None` or a tombstone deletes locally.
    AcceptRemote { remote: Option<RemoteVersion> },
    /// Nothing left to reconcile.
    Complete,
    /// Wait for a manual decision.
    Defer,
}

/// Outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub verdict: Verdict,
    /// Winning payload, `None` for a deletion or a deferral
    pub resolved_payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Classifies and resolves conflicts.
#[derive(Clone)]
pub struct ConflictResolver {
    comparator: Arc<dyn ConflictComparator>,
    concurrent_window_ms: u64,
}

impl ConflictResolver {
    pub fn new(comparator: Arc<dyn ConflictComparator>) -> Self {
        Self {
            comparator,
            concurrent_window_ms: DEFAULT_CONCURRENT_WINDOW_MS,
        }
    }

    pub fn with_concurrent_window(mut self, window_ms: u64) -> Self {
        self.concurrent_window_ms = window_ms;
        self
    }

    /// Classify the divergence between an operation and the remote state.
    ///
    /// `local` is the current local entity, tombstones included. Returns
    /// `None` when the two sides already agree and the operation can complete.
    pub fn detect(
        &self,
        op: &SyncOperation,
        local: Option<&Entity>,
        remote: Option<&RemoteVersion>,
    ) -> Option<Conflict> {
        let local_payload = match op.kind {
            OperationKind::Delete => None,
            _ => Some(
                local
                    .filter(|e| e.is_active())
                    .map(|e| e.payload.clone())
                    .unwrap_or_else(|| op.payload.clone()),
            ),
        };
        let local_updated_at = local.map(|e| e.updated_at).unwrap_or(op.created_at);

        let conflict_type = match (op.kind, remote) {
            (OperationKind::Create, _) => ConflictType::CreateConflict,
            (_, None) => ConflictType::CreateConflict,
            (OperationKind::Update, Some(r)) if r.deleted => ConflictType::UpdateDelete,
            (OperationKind::Update, Some(r)) => {
                let local_payload = local_payload.as_ref().unwrap_or(&op.payload);
                if self
                    .comparator
                    .equivalent(op.entity_type, local_payload, &r.payload)
                {
                    return None;
                }
                ConflictType::UpdateUpdate
            }
            (OperationKind::Delete, Some(r)) if r.deleted => return None,
            (OperationKind::Delete, Some(_)) => ConflictType::DeleteUpdate,
        };

        let differing_fields = match (&local_payload, remote.filter(|r| r.is_live())) {
            (Some(local), Some(remote)) => {
                self.comparator
                    .differing_fields(op.entity_type, local, &remote.payload)
            }
            _ => Vec::new(),
        };

        let concurrent = remote
            .map(|r| local_updated_at.abs_diff(r.updated_at) < self.concurrent_window_ms)
            .unwrap_or(false);

        Some(Conflict {
            conflict_type,
            operation_kind: op.kind,
            entity_type: op.entity_type,
            local: local_payload,
            local_updated_at,
            remote: remote.cloned(),
            differing_fields,
            concurrent,
        })
    }

    /// Apply an automatic strategy.
    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        now: Timestamp,
    ) -> Resolution {
        match strategy {
            ResolutionStrategy::Manual => Resolution {
                strategy,
                verdict: Verdict::Defer,
                resolved_payload: None,
            },
            ResolutionStrategy::LocalWins => self.side_wins(conflict, Side::Local, strategy),
            ResolutionStrategy::RemoteWins => self.side_wins(conflict, Side::Remote, strategy),
            ResolutionStrategy::LastWriteWins => {
                self.side_wins(conflict, last_writer(conflict), strategy)
            }
            ResolutionStrategy::Merge => match self.merge(conflict, now) {
                Some(merged) => Resolution {
                    strategy,
                    verdict: Verdict::Requeue {
                        kind: OperationKind::Update,
                        payload: Some(merged.clone()),
                        refresh_local: true,
                    },
                    resolved_payload: Some(merged),
                },
                None => self.side_wins(conflict, last_writer(conflict), strategy),
            },
        }
    }

    /// Apply a person's decision to a deferred conflict.
    pub fn resolve_manual(&self, conflict: &Conflict, choice: &ManualResolution) -> Resolution {
        match choice {
            ManualResolution::KeepLocal => {
                self.side_wins(conflict, Side::Local, ResolutionStrategy::LocalWins)
            }
            ManualResolution::KeepRemote => {
                self.side_wins(conflict, Side::Remote, ResolutionStrategy::RemoteWins)
            }
            ManualResolution::Custom(payload) => {
                let kind = if conflict.remote_live().is_some() {
                    OperationKind::Update
                } else {
                    OperationKind::Create
                };
                Resolution {
                    strategy: ResolutionStrategy::Manual,
                    verdict: Verdict::Requeue {
                        kind,
                        payload: Some(payload.clone()),
                        refresh_local: true,
                    },
                    resolved_payload: Some(payload.clone()),
                }
            }
        }
    }

    fn side_wins(
        &self,
        conflict: &Conflict,
        side: Side,
        strategy: ResolutionStrategy,
    ) -> Resolution {
        let remote_live = conflict.remote_live();

        let (verdict, resolved_payload) = match side {
            Side::Local => match (&conflict.local, remote_live) {
                (Some(payload), remote) => {
                    let kind = if remote.is_some() {
                        OperationKind::Update
                    } else {
                        OperationKind::Create
                    };
                    (
                        Verdict::Requeue {
                            kind,
                            payload: Some(payload.clone()),
                            refresh_local: false,
                        },
                        Some(payload.clone()),
                    )
                }
                (None, Some(_)) => (
                    Verdict::Requeue {
                        kind: OperationKind::Delete,
                        payload: None,
                        refresh_local: false,
                    },
                    None,
                ),
                (None, None) => (Verdict::Complete, None),
            },
            Side::Remote => match (remote_live, &conflict.local) {
                (Some(remote), _) => (
                    Verdict::AcceptRemote {
                        remote: Some(remote.clone()),
                    },
                    Some(remote.payload.clone()),
                ),
                (None, None) => (Verdict::Complete, None),
                (None, Some(_)) => (
                    Verdict::AcceptRemote {
                        remote: conflict.remote.clone(),
                    },
                    None,
                ),
            },
        };

        Resolution {
            strategy,
            verdict,
            resolved_payload,
        }
    }

    /// Field-level union of two live object payloads.
    fn merge(&self, conflict: &Conflict, now: Timestamp) -> Option<Value> {
        let local = conflict.local.as_ref()?.as_object()?;
        let remote = conflict.remote_live()?.payload.as_object()?;

        let mut merged = local.clone();
        for (field, value) in remote {
            merged.insert(field.clone(), value.clone());
        }
        for field in self.comparator.timestamp_fields(conflict.entity_type) {
            merged.insert(field, Value::from(now));
        }
        Some(Value::Object(merged))
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("concurrent_window_ms", &self.concurrent_window_ms)
            .finish_non_exhaustive()
    }
}

/// Strictly later local write wins; an absent remote record has no timestamp
/// to compete with.
fn last_writer(conflict: &Conflict) -> Side {
    match &conflict.remote {
        Some(remote) if conflict.local_updated_at <= remote.updated_at => Side::Remote,
        _ => Side::Local,
    }
}

/// Audit entry for one detected conflict.
///
/// A record is written once. Deferred records stay pending until
/// [`ConflictRecord::seal`] fills in the resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation_kind: OperationKind,
    pub conflict_type: ConflictType,
    pub local_version: Option<Value>,
    pub local_updated_at: Timestamp,
    pub remote_version: Option<RemoteVersion>,
    pub differing_fields: Vec<String>,
    pub concurrent: bool,
    pub resolution_strategy: ResolutionStrategy,
    pub resolved_payload: Option<Value>,
    pub resolved_at: Option<Timestamp>,
    /// `"auto"` or the person who resolved it
    pub resolved_by: Option<String>,
    pub detected_at: Timestamp,
}

impl ConflictRecord {
    /// Record a conflict; still pending until resolved.
    pub fn new(op: &SyncOperation, conflict: &Conflict, detected_at: Timestamp) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: op.id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            operation_kind: conflict.operation_kind,
            conflict_type: conflict.conflict_type,
            local_version: conflict.local.clone(),
            local_updated_at: conflict.local_updated_at,
            remote_version: conflict.remote.clone(),
            differing_fields: conflict.differing_fields.clone(),
            concurrent: conflict.concurrent,
            resolution_strategy: ResolutionStrategy::Manual,
            resolved_payload: None,
            resolved_at: None,
            resolved_by: None,
            detected_at,
        }
    }

    /// Record a conflict together with its automatic resolution.
    pub fn resolved(
        op: &SyncOperation,
        conflict: &Conflict,
        resolution: &Resolution,
        now: Timestamp,
    ) -> Self {
        let mut record = Self::new(op, conflict, now);
        record.resolution_strategy = resolution.strategy;
        record.resolved_payload = resolution.resolved_payload.clone();
        record.resolved_at = Some(now);
        record.resolved_by = Some(AUTO_RESOLVER.to_string());
        record
    }

    pub fn is_pending(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Rebuild the conflict as it was detected.
    pub fn conflict(&self) -> Conflict {
        Conflict {
            conflict_type: self.conflict_type,
            operation_kind: self.operation_kind,
            entity_type: self.entity_type,
            local: self.local_version.clone(),
            local_updated_at: self.local_updated_at,
            remote: self.remote_version.clone(),
            differing_fields: self.differing_fields.clone(),
            concurrent: self.concurrent,
        }
    }

    /// Fill in the resolution of a pending record.
    pub fn seal(
        &mut self,
        resolution: &Resolution,
        resolved_by: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), Error> {
        if !self.is_pending() {
            return Err(Error::ConflictAlreadyResolved(self.id.clone()));
        }
        self.resolution_strategy = resolution.strategy;
        self.resolved_payload = resolution.resolved_payload.clone();
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.into());
        Ok(())
    }
}
