//! # Queue Item Model
//!
//! The unit of work carried by the outbox.
//!
//! ## Database Schema
//!
//! Maps to the `sync_queue_items` table:
//! ```sql
//! CREATE TABLE sync_queue_items (
//!   id BIGSERIAL PRIMARY KEY,
//!   correlation_id TEXT NOT NULL,
//!   sequence INTEGER NOT NULL,
//!   table_name TEXT NOT NULL,
//!   record_id TEXT NOT NULL,
//!   operation TEXT NOT NULL,
//!   payload JSONB NOT NULL,
//!   depends_on_external_id_of TEXT,
//!   external_id TEXT,
//!   status TEXT NOT NULL DEFAULT 'pending',
//!   attempt_count INTEGER NOT NULL DEFAULT 0,
//!   idempotency_key UUID NOT NULL UNIQUE,
//!   -- ... claim and timestamp columns
//! );
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Pending**: written by the enqueuer, waiting for its predecessors and `next_attempt_at`
//! 2. **Claimed**: owned by exactly one dispatcher worker
//! 3. **Completed**: applied remotely; terminal
//! 4. **Dead-lettered**: gave up; terminal, blocks the rest of its correlation
//!
//! Terminal rows are retained for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Remote operation carried by a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("Invalid sync operation: {s}")),
        }
    }
}

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Owned by a dispatcher worker
    Claimed,
    /// Applied remotely
    Completed,
    /// Reserved for schema parity; retryable failures go back to `Pending`
    Failed,
    /// Retry budget exhausted or failure is permanent
    DeadLettered,
}

impl QueueItemStatus {
    /// Check if this is a terminal state (no further transitions by the dispatcher)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    /// Whether a later item in the same correlation may proceed
    pub fn satisfies_ordering(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("Invalid queue item status: {s}")),
        }
    }
}

/// A row of the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: i64,
    pub correlation_id: String,
    /// 1-based position within the correlation
    pub sequence: i32,
    pub table_name: String,
    pub record_id: String,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    /// Local record id whose external id must be folded into this payload
    pub depends_on_external_id_of: Option<String>,
    pub external_id: Option<String>,
    pub status: QueueItemStatus,
    pub attempt_count: i32,
    pub idempotency_key: Uuid,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

impl QueueItem {
    /// Materialize a freshly enqueued row
    pub fn from_new(id: i64, new_item: NewQueueItem, now: DateTime<Utc>) -> Self {
        Self {
            id,
            correlation_id: new_item.correlation_id,
            sequence: new_item.sequence,
            table_name: new_item.table_name,
            record_id: new_item.record_id,
            operation: new_item.operation,
            payload: new_item.payload,
            depends_on_external_id_of: new_item.depends_on_external_id_of,
            external_id: None,
            status: QueueItemStatus::Pending,
            attempt_count: 0,
            idempotency_key: new_item.idempotency_key,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: now,
        }
    }

    /// Whether this row is owned by `worker_id` right now
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == QueueItemStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Row to be inserted by the enqueuer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub correlation_id: String,
    pub sequence: i32,
    pub table_name: String,
    pub record_id: String,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub depends_on_external_id_of: Option<String>,
    pub idempotency_key: Uuid,
}

/// Raw row shape; enums are stored as text
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct QueueItemRow {
    pub id: i64,
    pub correlation_id: String,
    pub sequence: i32,
    pub table_name: String,
    pub record_id: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub depends_on_external_id_of: Option<String>,
    pub external_id: Option<String>,
    pub status: String,
    pub attempt_count: i32,
    pub idempotency_key: Uuid,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = sqlx::Error;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let operation = row
            .operation
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        let status = row
            .status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

        Ok(Self {
            id: row.id,
            correlation_id: row.correlation_id,
            sequence: row.sequence,
            table_name: row.table_name,
            record_id: row.record_id,
            operation,
            payload: row.payload,
            depends_on_external_id_of: row.depends_on_external_id_of,
            external_id: row.external_id,
            status,
            attempt_count: row.attempt_count,
            idempotency_key: row.idempotency_key,
            last_error: row.last_error,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}
