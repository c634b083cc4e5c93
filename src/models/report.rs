//! # Operator Report
//!
//! Read model surfacing dead-lettered items and the correlations stuck behind them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: i64,
    pub claimed: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

/// A correlation whose progress is held by a dead-lettered item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedCorrelation {
    pub correlation_id: String,
    pub dead_lettered_item_id: i64,
    pub dead_lettered_sequence: i32,
    pub table_name: String,
    pub record_id: String,
    pub last_error: Option<String>,
    /// Pending items held behind the dead letter
    pub blocked_items: i64,
    pub blocked_since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReport {
    pub counts: StatusCounts,
    /// Ordered oldest first
    pub blocked_correlations: Vec<BlockedCorrelation>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl QueueReport {
    pub fn dead_lettered(&self) -> i64 {
        self.counts.dead_lettered
    }

    pub fn oldest_blocked(&self) -> Option<&BlockedCorrelation> {
        self.blocked_correlations.first()
    }

    /// Number of items that can never complete without operator action
    pub fn total_blocked_items(&self) -> i64 {
        self.blocked_correlations
            .iter()
            .map(|b| b.blocked_items)
            .sum()
    }
}
