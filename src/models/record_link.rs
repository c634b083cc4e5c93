//! # Record Link Model
//!
//! Write-once association between a local record and the identifier the remote
//! system assigned to it. Later correlations read the link instead of replaying
//! the create.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RecordLink {
    pub table_name: String,
    pub record_id: String,
    pub external_id: String,
    /// Local view of the remote response, produced by the mapping layer
    pub local_patch: Option<serde_json::Value>,
    /// Queue item whose create established the link
    pub source_item_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Link to be recorded after a successful create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecordLink {
    pub table_name: String,
    pub record_id: String,
    pub external_id: String,
    pub local_patch: Option<serde_json::Value>,
    pub source_item_id: Option<i64>,
}
