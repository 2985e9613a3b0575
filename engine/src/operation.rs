//! Queued sync operations and their lifecycle.
//!
//! Every local mutation is captured as a [`SyncOperation`]. The status machine
//! lives here rather than in a store so that every [`OperationStore`]
//! implementation applies exactly the same transition rules.
//!
//! ```text
//! PENDING -> IN_PROGRESS -> COMPLETED
//!                        -> FAILED   -> RETRY_SCHEDULED -> PENDING
//!                        -> CONFLICT -> RETRY_SCHEDULED -> PENDING
//!                                    -> COMPLETED | FAILED
//! ```
//!
//! [`OperationStore`]: crate::store::OperationStore

use crate::{error::Result, EntityId, Error, OperationId, Priority, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default retry budget for new operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Business entities the engine knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Quote,
    Client,
    Site,
    SupplyItem,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 4] = [
        EntityType::Quote,
        EntityType::Client,
        EntityType::Site,
        EntityType::SupplyItem,
    ];

    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Quote => "QUOTE",
            EntityType::Client => "CLIENT",
            EntityType::Site => "SITE",
            EntityType::SupplyItem => "SUPPLY_ITEM",
        }
    }

    /// URL path segment used by HTTP collaborators.
    pub fn path_segment(&self) -> &'static str {
        match self {
            EntityType::Quote => "quotes",
            EntityType::Client => "clients",
            EntityType::Site => "sites",
            EntityType::SupplyItem => "supply-items",
        }
    }

    /// Parse a URL path segment back into an entity type.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.path_segment() == segment)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Unrecognized(format!("entity type '{s}'")))
    }
}

/// What the operation does to the remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(OperationKind::Create),
            "UPDATE" => Ok(OperationKind::Update),
            "DELETE" => Ok(OperationKind::Delete),
            other => Err(Error::Unrecognized(format!("operation kind '{other}'"))),
        }
    }
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Conflict,
    RetryScheduled,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 6] = [
        SyncStatus::Pending,
        SyncStatus::InProgress,
        SyncStatus::Completed,
        SyncStatus::Failed,
        SyncStatus::Conflict,
        SyncStatus::RetryScheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Conflict => "CONFLICT",
            SyncStatus::RetryScheduled => "RETRY_SCHEDULED",
        }
    }

    /// Whether `self -> next` is an edge of the status machine.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Conflict)
                | (Failed, RetryScheduled)
                | (Conflict, RetryScheduled)
                | (Conflict, Completed)
                | (Conflict, Failed)
                | (RetryScheduled, Pending)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Unrecognized(format!("sync status '{s}'")))
    }
}

/// One queued intent to create, update or delete a remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique operation ID, generated at enqueue time
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Opaque snapshot of the entity at enqueue time
    pub payload: serde_json::Value,
    /// Local entity version the mutation was made against (0 for creates)
    pub base_version: Version,
    pub status: SyncStatus,
    /// Higher drains first
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_attempt_at: Option<Timestamp>,
    /// When a RETRY_SCHEDULED operation becomes due again
    pub next_retry_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub conflict_detail: Option<String>,
}

impl SyncOperation {
    /// Create a new PENDING operation with a fresh ID.
    pub fn new(
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            base_version: 0,
            status: SyncStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            next_retry_at: None,
            error_message: None,
            conflict_detail: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_version(mut self, version: Version) -> Self {
        self.base_version = version;
        self
    }

    /// No retry budget left.
    pub fn is_retry_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// COMPLETED, or FAILED with the retry budget used up.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            SyncStatus::Completed => true,
            SyncStatus::Failed => self.is_retry_exhausted(),
            _ => false,
        }
    }

    /// Whether a RETRY_SCHEDULED operation may go back to PENDING.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == SyncStatus::RetryScheduled && self.next_retry_at.unwrap_or(0) <= now
    }

    /// Apply a status change, enforcing the transition rules.
    ///
    /// On error the operation is left untouched.
    pub fn apply_change(&mut self, change: &StatusChange, now: Timestamp) -> Result<()> {
        let next = change.status;
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        let mut retry_count = if change.reset_retries {
            0
        } else {
            self.retry_count
        };

        if next == SyncStatus::RetryScheduled && retry_count >= self.max_retries {
            return Err(Error::RetriesExhausted {
                id: self.id.clone(),
                retries: retry_count,
            });
        }

        match next {
            SyncStatus::InProgress => {
                self.last_attempt_at = Some(now);
                self.clear_details();
            }
            SyncStatus::Failed => {
                // CONFLICT -> FAILED already paid for the attempt
                if self.status == SyncStatus::InProgress {
                    retry_count = retry_count.saturating_add(1);
                }
                if change.exhaust {
                    retry_count = retry_count.max(self.max_retries);
                }
                if let Some(error) = &change.error {
                    self.error_message = Some(error.clone());
                }
                if let Some(detail) = &change.conflict {
                    self.conflict_detail = Some(detail.clone());
                }
            }
            SyncStatus::Conflict => {
                retry_count = retry_count.saturating_add(1);
                self.error_message = change.error.clone();
                self.conflict_detail = change.conflict.clone();
            }
            SyncStatus::RetryScheduled => {
                self.next_retry_at = Some(change.retry_at.unwrap_or(now));
                self.clear_details();
            }
            SyncStatus::Pending | SyncStatus::Completed => {
                self.next_retry_at = None;
                self.clear_details();
            }
        }

        if let Some(payload) = &change.payload {
            self.payload = payload.clone();
        }
        if let Some(kind) = change.kind {
            self.kind = kind;
        }

        self.retry_count = retry_count;
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn clear_details(&mut self) {
        self.error_message = None;
        self.conflict_detail = None;
    }
}

/// A requested status transition plus the data that travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: SyncStatus,
    pub error: Option<String>,
    pub conflict: Option<String>,
    /// Replacement payload (conflict resolution)
    pub payload: Option<serde_json::Value>,
    /// Replacement kind (conflict resolution)
    pub kind: Option<OperationKind>,
    pub retry_at: Option<Timestamp>,
    /// Use up the remaining retry budget (permanent failures)
    pub exhaust: bool,
    /// Restore the full retry budget (manual retry or resolution)
    pub reset_retries: bool,
}

impl StatusChange {
    pub fn to(status: SyncStatus) -> Self {
        Self {
            status,
            error: None,
            conflict: None,
            payload: None,
            kind: None,
            retry_at: None,
            exhaust: false,
            reset_retries: false,
        }
    }

    pub fn in_progress() -> Self {
        Self::to(SyncStatus::InProgress)
    }

    pub fn completed() -> Self {
        Self::to(SyncStatus::Completed)
    }

    pub fn pending() -> Self {
        Self::to(SyncStatus::Pending)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::to(SyncStatus::Failed)
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self {
            conflict: Some(detail.into()),
            ..Self::to(SyncStatus::Conflict)
        }
    }

    pub fn retry_at(at: Timestamp) -> Self {
        Self {
            retry_at: Some(at),
            ..Self::to(SyncStatus::RetryScheduled)
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn exhausted(mut self) -> Self {
        self.exhaust = true;
        self
    }

    pub fn reset_retries(mut self) -> Self {
        self.reset_retries = true;
        self
    }
}
