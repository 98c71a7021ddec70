//! Shared types for the outbox dispatcher: the persisted record, cluster
//! instance, routing primitives, and the dispatcher-wide error taxonomy.
//!
//! Every other crate in the workspace depends on this one. Nothing here
//! touches I/O — it is pure data plus the trait contracts that tie the
//! storage, handler, and pipeline crates together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value metadata attached to a record or carried through a
/// failure. `BTreeMap` keeps iteration and JSON serialization order
/// deterministic, which matters for log lines and the `context` column.
pub type Context = BTreeMap<String, String>;

/// Lifecycle state of a persisted record. Transitions are one-directional
/// except for `PENDING -> RETRY_SCHEDULED -> PENDING`, which repeats until
/// a terminal state (`COMPLETED`, `FAILED`) is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Claimed,
    RetryScheduled,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

/// A single outbox record as persisted by the producer and consumed by the
/// dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub key: String,
    pub partition: i16,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub context: Context,
    pub status: RecordStatus,
    pub attempt: i32,
    pub failure_count: i32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Metadata passed to a handler alongside the decoded payload. Carries
/// enough of the record's own bookkeeping that a handler can log or branch
/// on attempt count without reaching back into storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub record_id: Uuid,
    pub key: String,
    pub payload_type: String,
    pub attempt: i32,
    pub context: Context,
}

/// Passed to a fallback handler when the primary handler has exhausted
/// retries or raised a non-retryable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub record_id: Uuid,
    pub key: String,
    pub payload_type: String,
    pub attempt: i32,
    pub failure_count: i32,
    pub last_error: String,
    pub context: Context,
}

/// Liveness state of a cluster instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Live,
    Draining,
}

/// A row in the instance registry: one per running dispatcher process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Outcome a handler returns to the dispatch pipeline. Handlers do not
/// raise typed exceptions; they classify their own failure up front so the
/// retry policy engine never has to inspect an opaque error.
#[derive(Debug)]
pub enum HandlerOutcome {
    Success,
    Retryable(anyhow::Error),
    NonRetryable(anyhow::Error),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}

/// The dispatcher-wide error taxonomy. Every crate that can fail in a way
/// the dispatch pipeline needs to branch on returns this type rather than
/// a bare `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("handler raised a retryable error: {0}")]
    HandlerRetryable(#[source] anyhow::Error),

    #[error("handler raised a non-retryable error: {0}")]
    HandlerNonRetryable(#[source] anyhow::Error),

    #[error("fallback handler failed: {0}")]
    Fallback(#[source] anyhow::Error),

    #[error("instance lost ownership of partition {partition} mid-dispatch")]
    OwnershipLost { partition: u16 },

    #[error("no handler registered for payload type {0:?}")]
    NoHandler(String),
}
