//! # Queue Store
//!
//! Durable state of the outbox: queue items, their status transitions, and the
//! write-once record links produced by successful creates.
//!
//! ## Claim Protocol
//!
//! An item is claimable when it is `pending`, its `next_attempt_at` has passed,
//! and every item with a lower sequence in the same correlation is `completed`.
//! Claiming moves it to `claimed`, stamps the worker id and increments
//! `attempt_count` in one atomic step. Concurrent claimers never receive the
//! same item.
//!
//! Every transition out of `claimed` is fenced on the claiming worker id: a
//! worker whose claim was reaped cannot overwrite the outcome of the worker
//! that re-claimed the item. Fenced calls return `false` when the fence fails.
//!
//! Two implementations ship with the crate:
//!
//! - [`PgQueueStore`] - PostgreSQL, `FOR UPDATE SKIP LOCKED` claims
//! - [`InMemoryQueueStore`] - single-process store for tests and embedding

pub mod memory;
pub mod postgres;

pub use memory::InMemoryQueueStore;
pub use postgres::PgQueueStore;

use crate::error::Result;
use crate::models::{NewQueueItem, NewRecordLink, QueueItem, QueueReport, RecordLink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of inserting a correlation's items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub enqueued: usize,
    /// Items skipped because their idempotency key was already present
    pub duplicates: usize,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert all items or none. Items whose idempotency key already exists are
    /// skipped and counted as duplicates.
    async fn insert_items(&self, items: Vec<NewQueueItem>, now: DateTime<Utc>)
        -> Result<EnqueueOutcome>;

    /// Claim up to `limit` eligible items, at most one per correlation,
    /// ordered by `(correlation_id, sequence)`.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>>;

    /// Claim the eligible head of one correlation, if any
    async fn claim_next_in_correlation(
        &self,
        worker_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>>;

    /// `claimed -> completed`. A create's assigned id is stored on the item.
    async fn mark_completed(
        &self,
        item_id: i64,
        worker_id: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `claimed -> pending`, due again at `next_attempt_at`
    async fn schedule_retry(
        &self,
        item_id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `claimed -> dead_lettered`
    async fn dead_letter(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `claimed -> pending` without consuming the attempt
    async fn release_claim(
        &self,
        item_id: i64,
        worker_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a link unless one exists. Returns the link that is stored
    /// afterwards, which is the earlier one on conflict.
    async fn record_link(&self, link: NewRecordLink, now: DateTime<Utc>) -> Result<RecordLink>;

    async fn find_link(&self, table_name: &str, record_id: &str) -> Result<Option<RecordLink>>;

    /// All items of a correlation ordered by sequence
    async fn list_correlation(&self, correlation_id: &str) -> Result<Vec<QueueItem>>;

    async fn get_item(&self, item_id: i64) -> Result<Option<QueueItem>>;

    /// Return claims older than `claimed_before` to `pending`. Returns the
    /// number of items released.
    async fn reap_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn report(&self, now: DateTime<Utc>) -> Result<QueueReport>;

    /// `dead_lettered -> pending` with a fresh attempt budget. Returns `false`
    /// when the item is not dead-lettered.
    async fn requeue_dead_letter(&self, item_id: i64, now: DateTime<Utc>) -> Result<bool>;
}

pub(crate) const STALE_CLAIM_PREFIX: &str = "claim by ";
pub(crate) const STALE_CLAIM_SUFFIX: &str = " expired before an outcome was recorded";

/// `last_error` text written when the reaper releases a claim
pub(crate) fn stale_claim_note(worker_id: Option<&str>) -> String {
    format!(
        "{STALE_CLAIM_PREFIX}{}{STALE_CLAIM_SUFFIX}",
        worker_id.unwrap_or("unknown worker")
    )
}
