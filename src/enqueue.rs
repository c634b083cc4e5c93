//! # Enqueuer
//!
//! Records the remote side effects of one logical business transaction as an
//! ordered correlation of queue items.
//!
//! Sequences are assigned from list position (1-based) so they are always
//! contiguous. Each item's idempotency key is a UUIDv5 of
//! `(correlation_id, table, record_id, sequence)`, which makes enqueueing the
//! same event twice a no-op: the second call reports every item as a duplicate.
//!
//! The enqueuer only inserts. Status and attempt counts belong to the
//! dispatcher.

use crate::error::{Result, ValidationError};
use crate::models::{NewQueueItem, SyncOperation};
use crate::store::{EnqueueOutcome, QueueStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Namespace for idempotency keys
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b5e_93d4_4a7e_b0c8_51e2_7d9a_f304);

/// One side effect as supplied by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueItem {
    #[serde(alias = "tableName")]
    pub table: String,
    pub record_id: String,
    pub operation: SyncOperation,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on_external_id_of: Option<String>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl EnqueueItem {
    pub fn new(
        table: impl Into<String>,
        record_id: impl Into<String>,
        operation: SyncOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
            operation,
            payload,
            depends_on_external_id_of: None,
        }
    }

    pub fn create(
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(table, record_id, SyncOperation::Create, payload)
    }

    pub fn update(
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(table, record_id, SyncOperation::Update, payload)
    }

    pub fn delete(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::new(table, record_id, SyncOperation::Delete, empty_payload())
    }

    /// Declare that this item needs the external id assigned to `record_id`
    pub fn depends_on(mut self, record_id: impl Into<String>) -> Self {
        self.depends_on_external_id_of = Some(record_id.into());
        self
    }
}

/// Deterministic key identifying one item of one correlation
pub fn idempotency_key(correlation_id: &str, table: &str, record_id: &str, sequence: i32) -> Uuid {
    // Unit separators keep ("a", "bc") and ("ab", "c") apart
    let name = format!("{correlation_id}\u{1f}{table}\u{1f}{record_id}\u{1f}{sequence}");
    Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes())
}

/// Validate a correlation and turn it into insertable rows
pub fn prepare_items(
    correlation_id: &str,
    items: Vec<EnqueueItem>,
) -> std::result::Result<Vec<NewQueueItem>, ValidationError> {
    if correlation_id.trim().is_empty() {
        return Err(ValidationError::EmptyCorrelationId);
    }
    if items.is_empty() {
        return Err(ValidationError::NoItems);
    }

    let mut earlier_records: HashSet<String> = HashSet::new();
    let mut rows = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let position = index + 1;
        if item.table.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                position,
                field: "table",
            });
        }
        if item.record_id.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                position,
                field: "recordId",
            });
        }
        if !item.payload.is_object() {
            return Err(ValidationError::PayloadNotObject { position });
        }
        if let Some(dependency) = &item.depends_on_external_id_of {
            if !earlier_records.contains(dependency) {
                return Err(ValidationError::UnknownDependency {
                    position,
                    record_id: dependency.clone(),
                });
            }
        }

        let sequence = position as i32;
        earlier_records.insert(item.record_id.clone());
        rows.push(NewQueueItem {
            correlation_id: correlation_id.to_string(),
            sequence,
            idempotency_key: idempotency_key(correlation_id, &item.table, &item.record_id, sequence),
            table_name: item.table,
            record_id: item.record_id,
            operation: item.operation,
            payload: item.payload,
            depends_on_external_id_of: item.depends_on_external_id_of,
        });
    }

    Ok(rows)
}

/// Writes correlations into the queue store
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn QueueStore>,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Enqueue all items of one correlation, all or nothing.
    ///
    /// Re-enqueueing the same correlation is safe: already-present items are
    /// counted as duplicates and logged, never raised as errors.
    #[instrument(skip(self, items), fields(correlation_id = %correlation_id, items = items.len()))]
    pub async fn enqueue(
        &self,
        correlation_id: &str,
        items: Vec<EnqueueItem>,
    ) -> Result<EnqueueOutcome> {
        let rows = prepare_items(correlation_id, items)?;
        let outcome = self.store.insert_items(rows, Utc::now()).await?;

        if outcome.duplicates > 0 {
            warn!(
                correlation_id = %correlation_id,
                duplicates = outcome.duplicates,
                enqueued = outcome.enqueued,
                "Duplicate enqueue ignored"
            );
        }
        info!(
            correlation_id = %correlation_id,
            enqueued = outcome.enqueued,
            "Enqueued correlation"
        );

        Ok(outcome)
    }
}
