//! In-process queue store.
//!
//! Holds the whole queue behind one mutex, so every operation is atomic with
//! respect to every other. Used by the test suite and by embedders that do not
//! need durability across restarts.

use super::{stale_claim_note, EnqueueOutcome, QueueStore};
use crate::error::{Result, SyncError};
use crate::models::{
    BlockedCorrelation, NewQueueItem, NewRecordLink, QueueItem, QueueItemStatus, QueueReport,
    RecordLink, StatusCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<i64, QueueItem>,
    keys: HashMap<Uuid, i64>,
    positions: HashMap<(String, i32), i64>,
    links: HashMap<(String, String), RecordLink>,
    next_id: i64,
}

impl Inner {
    /// Items of one correlation in sequence order
    fn correlation(&self, correlation_id: &str) -> Vec<&QueueItem> {
        let mut items: Vec<&QueueItem> = self
            .items
            .values()
            .filter(|item| item.correlation_id == correlation_id)
            .collect();
        items.sort_by_key(|item| item.sequence);
        items
    }

    /// Id of the correlation's claimable head, if it has one
    fn eligible_head(&self, correlation_id: &str, now: DateTime<Utc>) -> Option<i64> {
        let head = self
            .correlation(correlation_id)
            .into_iter()
            .find(|item| !item.status.satisfies_ordering())?;
        (head.status == QueueItemStatus::Pending && head.next_attempt_at <= now).then_some(head.id)
    }

    fn claim(&mut self, item_id: i64, worker_id: &str, now: DateTime<Utc>) -> Option<QueueItem> {
        let item = self.items.get_mut(&item_id)?;
        item.status = QueueItemStatus::Claimed;
        item.attempt_count += 1;
        item.claimed_by = Some(worker_id.to_string());
        item.claimed_at = Some(now);
        item.updated_at = now;
        Some(item.clone())
    }

    /// Mutable access to an item only while `worker_id` holds its claim
    fn fenced(&mut self, item_id: i64, worker_id: &str) -> Option<&mut QueueItem> {
        self.items
            .get_mut(&item_id)
            .filter(|item| item.is_claimed_by(worker_id))
    }
}

/// Queue store held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<Inner>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every item, ordered by id
    pub fn items(&self) -> Vec<QueueItem> {
        self.inner.lock().items.values().cloned().collect()
    }

    /// Force an item's next attempt time. Lets tests skip a backoff delay.
    pub fn set_next_attempt_at(&self, item_id: i64, at: DateTime<Utc>) -> bool {
        match self.inner.lock().items.get_mut(&item_id) {
            Some(item) => {
                item.next_attempt_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_items(
        &self,
        items: Vec<NewQueueItem>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock();

        // Validate the whole batch before touching state so a conflict inserts nothing
        let mut fresh = Vec::with_capacity(items.len());
        let mut seen_keys = HashSet::new();
        let mut seen_positions = HashSet::new();
        let mut outcome = EnqueueOutcome::default();
        for item in items {
            if inner.keys.contains_key(&item.idempotency_key)
                || !seen_keys.insert(item.idempotency_key)
            {
                outcome.duplicates += 1;
                continue;
            }
            let position = (item.correlation_id.clone(), item.sequence);
            if inner.positions.contains_key(&position) || !seen_positions.insert(position.clone())
            {
                return Err(SyncError::SequenceConflict {
                    correlation_id: position.0,
                    sequence: position.1,
                });
            }
            fresh.push(item);
        }

        for item in fresh {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.keys.insert(item.idempotency_key, id);
            inner
                .positions
                .insert((item.correlation_id.clone(), item.sequence), id);
            inner.items.insert(id, QueueItem::from_new(id, item, now));
            outcome.enqueued += 1;
        }

        Ok(outcome)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let mut inner = self.inner.lock();

        let correlations: Vec<String> = inner
            .items
            .values()
            .filter(|item| item.status == QueueItemStatus::Pending)
            .map(|item| item.correlation_id.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut claimed = Vec::new();
        for correlation_id in correlations {
            if claimed.len() >= limit {
                break;
            }
            if let Some(id) = inner.eligible_head(&correlation_id, now) {
                if let Some(item) = inner.claim(id, worker_id, now) {
                    claimed.push(item);
                }
            }
        }

        Ok(claimed)
    }

    async fn claim_next_in_correlation(
        &self,
        worker_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .eligible_head(correlation_id, now)
            .and_then(|id| inner.claim(id, worker_id, now)))
    }

    async fn mark_completed(
        &self,
        item_id: i64,
        worker_id: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.fenced(item_id, worker_id) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Completed;
        if item.external_id.is_none() {
            item.external_id = external_id.map(str::to_string);
        }
        item.last_error = None;
        item.updated_at = now;
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        item_id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.fenced(item_id, worker_id) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Pending;
        item.next_attempt_at = next_attempt_at;
        item.last_error = Some(last_error.to_string());
        item.claimed_by = None;
        item.claimed_at = None;
        item.updated_at = now;
        Ok(true)
    }

    async fn dead_letter(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.fenced(item_id, worker_id) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::DeadLettered;
        item.last_error = Some(last_error.to_string());
        item.updated_at = now;
        Ok(true)
    }

    async fn release_claim(
        &self,
        item_id: i64,
        worker_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.fenced(item_id, worker_id) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Pending;
        item.attempt_count = (item.attempt_count - 1).max(0);
        item.last_error = Some(note.to_string());
        item.claimed_by = None;
        item.claimed_at = None;
        item.updated_at = now;
        Ok(true)
    }

    async fn record_link(&self, link: NewRecordLink, now: DateTime<Utc>) -> Result<RecordLink> {
        let mut inner = self.inner.lock();
        let key = (link.table_name.clone(), link.record_id.clone());
        let stored = inner.links.entry(key).or_insert_with(|| RecordLink {
            table_name: link.table_name,
            record_id: link.record_id,
            external_id: link.external_id,
            local_patch: link.local_patch,
            source_item_id: link.source_item_id,
            created_at: now,
        });
        Ok(stored.clone())
    }

    async fn find_link(&self, table_name: &str, record_id: &str) -> Result<Option<RecordLink>> {
        Ok(self
            .inner
            .lock()
            .links
            .get(&(table_name.to_string(), record_id.to_string()))
            .cloned())
    }

    async fn list_correlation(&self, correlation_id: &str) -> Result<Vec<QueueItem>> {
        Ok(self
            .inner
            .lock()
            .correlation(correlation_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_item(&self, item_id: i64) -> Result<Option<QueueItem>> {
        Ok(self.inner.lock().items.get(&item_id).cloned())
    }

    async fn reap_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut reaped = 0;
        for item in inner.items.values_mut() {
            let stale = item.status == QueueItemStatus::Claimed
                && item.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                item.last_error = Some(stale_claim_note(item.claimed_by.as_deref()));
                item.status = QueueItemStatus::Pending;
                item.claimed_by = None;
                item.claimed_at = None;
                item.next_attempt_at = now;
                item.updated_at = now;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn report(&self, now: DateTime<Utc>) -> Result<QueueReport> {
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();
        for item in inner.items.values() {
            match item.status {
                QueueItemStatus::Pending => counts.pending += 1,
                QueueItemStatus::Claimed => counts.claimed += 1,
                QueueItemStatus::Completed => counts.completed += 1,
                QueueItemStatus::Failed => counts.failed += 1,
                QueueItemStatus::DeadLettered => counts.dead_lettered += 1,
            }
        }

        // The lowest dead-lettered sequence is the one holding the correlation
        let mut heads: BTreeMap<&str, &QueueItem> = BTreeMap::new();
        for item in inner
            .items
            .values()
            .filter(|item| item.status == QueueItemStatus::DeadLettered)
        {
            heads
                .entry(item.correlation_id.as_str())
                .and_modify(|current| {
                    if item.sequence < current.sequence {
                        *current = item;
                    }
                })
                .or_insert(item);
        }

        let mut blocked_correlations: Vec<BlockedCorrelation> = heads
            .into_values()
            .map(|dead| BlockedCorrelation {
                correlation_id: dead.correlation_id.clone(),
                dead_lettered_item_id: dead.id,
                dead_lettered_sequence: dead.sequence,
                table_name: dead.table_name.clone(),
                record_id: dead.record_id.clone(),
                last_error: dead.last_error.clone(),
                blocked_items: inner
                    .items
                    .values()
                    .filter(|item| {
                        item.correlation_id == dead.correlation_id
                            && item.sequence > dead.sequence
                            && item.status == QueueItemStatus::Pending
                    })
                    .count() as i64,
                blocked_since: dead.updated_at,
            })
            .collect();
        blocked_correlations.sort_by(|a, b| {
            a.blocked_since
                .cmp(&b.blocked_since)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });

        Ok(QueueReport {
            counts,
            blocked_correlations,
            generated_at: Some(now),
        })
    }

    async fn requeue_dead_letter(&self, item_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.items.get_mut(&item_id) {
            Some(item) if item.status == QueueItemStatus::DeadLettered => {
                item.status = QueueItemStatus::Pending;
                item.attempt_count = 0;
                item.claimed_by = None;
                item.claimed_at = None;
                item.next_attempt_at = now;
                item.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SyncError::NotFound(item_id)),
        }
    }
}
