//! # PostgreSQL Queue Store
//!
//! Durable store backed by the `sync_queue_items` and `sync_record_links`
//! tables.
//!
//! ## Claiming
//!
//! Claims run as one `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement. Rows locked by another claimer are skipped rather than waited
//! on, so overlapping triggers partition the work instead of serializing on it.
//! Predecessor checks run inside the same statement:
//!
//! ```sql
//! NOT EXISTS (
//!     SELECT 1 FROM sync_queue_items prev
//!     WHERE prev.correlation_id = q.correlation_id
//!       AND prev.sequence < q.sequence
//!       AND prev.status <> 'completed'
//! )
//! ```
//!
//! ## Transactional Enqueue
//!
//! [`PgQueueStore::enqueue_in_transaction`] writes queue rows on the caller's
//! transaction, so the primary write and its sync intent commit or roll back
//! together.

use super::{EnqueueOutcome, QueueStore, STALE_CLAIM_PREFIX, STALE_CLAIM_SUFFIX};
use crate::enqueue::{prepare_items, EnqueueItem};
use crate::error::{Result, SyncError};
use crate::models::queue_item::QueueItemRow;
use crate::models::{
    BlockedCorrelation, NewQueueItem, NewRecordLink, QueueItem, QueueReport, RecordLink,
    StatusCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, error, info, instrument, warn};

const ITEM_COLUMNS: &str = "id, correlation_id, sequence, table_name, record_id, operation, \
     payload, depends_on_external_id_of, external_id, status, attempt_count, idempotency_key, \
     last_error, claimed_by, claimed_at, created_at, updated_at, next_attempt_at";

const LINK_COLUMNS: &str =
    "table_name, record_id, external_id, local_patch, source_item_id, created_at";

const SEQUENCE_CONSTRAINT: &str = "sync_queue_items_correlation_sequence_key";

#[derive(Debug, FromRow)]
struct StatusCountRow {
    status: String,
    total: i64,
}

#[derive(Debug, FromRow)]
struct BlockedCorrelationRow {
    correlation_id: String,
    dead_lettered_item_id: i64,
    dead_lettered_sequence: i32,
    table_name: String,
    record_id: String,
    last_error: Option<String>,
    blocked_items: i64,
    blocked_since: DateTime<Utc>,
}

/// Queue store on a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a correlation on the caller's transaction.
    ///
    /// Validation and idempotency-key derivation are identical to
    /// [`crate::enqueue::Enqueuer::enqueue`]. Nothing is visible to the
    /// dispatcher until the caller commits.
    #[instrument(skip(tx, items), fields(correlation_id = %correlation_id, items = items.len()))]
    pub async fn enqueue_in_transaction(
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: &str,
        items: Vec<EnqueueItem>,
    ) -> Result<EnqueueOutcome> {
        let rows = prepare_items(correlation_id, items)?;
        let outcome = Self::insert_rows(&mut **tx, rows, Utc::now()).await?;
        debug!(
            enqueued = outcome.enqueued,
            duplicates = outcome.duplicates,
            "Enqueued correlation inside caller transaction"
        );
        Ok(outcome)
    }

    async fn insert_rows(
        conn: &mut PgConnection,
        rows: Vec<NewQueueItem>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut outcome = EnqueueOutcome::default();

        for row in rows {
            let inserted: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO sync_queue_items (
                    correlation_id, sequence, table_name, record_id, operation, payload,
                    depends_on_external_id_of, idempotency_key, status, attempt_count,
                    created_at, updated_at, next_attempt_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $9, $9)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&row.correlation_id)
            .bind(row.sequence)
            .bind(&row.table_name)
            .bind(&row.record_id)
            .bind(row.operation.as_str())
            .bind(&row.payload)
            .bind(&row.depends_on_external_id_of)
            .bind(row.idempotency_key)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_insert_error(e, &row))?;

            match inserted {
                Some(_) => outcome.enqueued += 1,
                None => outcome.duplicates += 1,
            }
        }

        Ok(outcome)
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        correlation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let query = format!(
            r#"
            WITH candidates AS (
                SELECT q.id AS candidate_id
                FROM sync_queue_items q
                WHERE q.status = 'pending'
                  AND q.next_attempt_at <= $1
                  AND ($4::TEXT IS NULL OR q.correlation_id = $4)
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_queue_items prev
                      WHERE prev.correlation_id = q.correlation_id
                        AND prev.sequence < q.sequence
                        AND prev.status <> 'completed'
                  )
                ORDER BY q.correlation_id, q.sequence
                LIMIT $2
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE sync_queue_items
            SET status = 'claimed',
                attempt_count = attempt_count + 1,
                claimed_by = $3,
                claimed_at = $1,
                updated_at = $1
            FROM candidates
            WHERE id = candidates.candidate_id
            RETURNING {ITEM_COLUMNS}
            "#
        );

        let rows = sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(now)
            .bind(limit)
            .bind(worker_id)
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!(worker_id = %worker_id, "Failed to claim queue items: {}", e);
                SyncError::Database(e)
            })?;

        let mut items = rows
            .into_iter()
            .map(QueueItem::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| {
            a.correlation_id
                .cmp(&b.correlation_id)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(items)
    }

    /// Whether a fenced update found the claim still held by `worker_id`
    fn fence_held(item_id: i64, worker_id: &str, transition: &str, rows_affected: u64) -> bool {
        let held = rows_affected == 1;
        if !held {
            warn!(
                item_id = item_id,
                worker_id = %worker_id,
                transition = %transition,
                "Fenced update rejected; claim no longer held by this worker"
            );
        }
        held
    }
}

fn map_insert_error(error: sqlx::Error, row: &NewQueueItem) -> SyncError {
    let is_sequence_conflict = error
        .as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|constraint| constraint == SEQUENCE_CONSTRAINT);

    if is_sequence_conflict {
        SyncError::SequenceConflict {
            correlation_id: row.correlation_id.clone(),
            sequence: row.sequence,
        }
    } else {
        SyncError::Database(error)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn insert_items(
        &self,
        items: Vec<NewQueueItem>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_rows(&mut *tx, items, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let items = self.claim(worker_id, limit, None, now).await?;

        if !items.is_empty() {
            info!(
                claimed_count = items.len(),
                worker_id = %worker_id,
                "Claimed queue items"
            );
        } else {
            debug!("No eligible queue items to claim");
        }
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn claim_next_in_correlation(
        &self,
        worker_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        Ok(self
            .claim(worker_id, 1, Some(correlation_id), now)
            .await?
            .into_iter()
            .next())
    }

    async fn mark_completed(
        &self,
        item_id: i64,
        worker_id: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'completed',
                external_id = COALESCE(external_id, $3),
                last_error = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(external_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Self::fence_held(item_id, worker_id, "mark_completed", result.rows_affected()))
    }

    async fn schedule_retry(
        &self,
        item_id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'pending',
                next_attempt_at = $3,
                last_error = $4,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Self::fence_held(item_id, worker_id, "schedule_retry", result.rows_affected()))
    }

    async fn dead_letter(
        &self,
        item_id: i64,
        worker_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'dead_lettered',
                last_error = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Self::fence_held(item_id, worker_id, "dead_letter", result.rows_affected()))
    }

    async fn release_claim(
        &self,
        item_id: i64,
        worker_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'pending',
                attempt_count = GREATEST(attempt_count - 1, 0),
                last_error = $3,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(note)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Self::fence_held(item_id, worker_id, "release_claim", result.rows_affected()))
    }

    async fn record_link(&self, link: NewRecordLink, now: DateTime<Utc>) -> Result<RecordLink> {
        let query = format!(
            r#"
            INSERT INTO sync_record_links (
                table_name, record_id, external_id, local_patch, source_item_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (table_name, record_id) DO NOTHING
            RETURNING {LINK_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, RecordLink>(&query)
            .bind(&link.table_name)
            .bind(&link.record_id)
            .bind(&link.external_id)
            .bind(&link.local_patch)
            .bind(link.source_item_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        // The conflicting row may have been committed after this statement's
        // snapshot, so read it back with a fresh statement.
        let stored = match inserted {
            Some(stored) => stored,
            None => self
                .find_link(&link.table_name, &link.record_id)
                .await?
                .ok_or(SyncError::Database(sqlx::Error::RowNotFound))?,
        };

        if stored.external_id != link.external_id {
            warn!(
                table = %link.table_name,
                record_id = %link.record_id,
                stored_external_id = %stored.external_id,
                rejected_external_id = %link.external_id,
                "Record link already exists; keeping the original external id"
            );
        }
        Ok(stored)
    }

    async fn find_link(&self, table_name: &str, record_id: &str) -> Result<Option<RecordLink>> {
        let query = format!(
            "SELECT {LINK_COLUMNS} FROM sync_record_links WHERE table_name = $1 AND record_id = $2"
        );
        let link = sqlx::query_as::<_, RecordLink>(&query)
            .bind(table_name)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(link)
    }

    async fn list_correlation(&self, correlation_id: &str) -> Result<Vec<QueueItem>> {
        let query = format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue_items WHERE correlation_id = $1 ORDER BY sequence"
        );
        let rows = sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(QueueItem::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get_item(&self, item_id: i64) -> Result<Option<QueueItem>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM sync_queue_items WHERE id = $1");
        let row = sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(QueueItem::try_from).transpose()?)
    }

    #[instrument(skip(self))]
    async fn reap_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'pending',
                last_error = $3 || COALESCE(claimed_by, 'unknown worker') || $4,
                claimed_by = NULL,
                claimed_at = NULL,
                next_attempt_at = $2,
                updated_at = $2
            WHERE status = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(STALE_CLAIM_PREFIX)
        .bind(STALE_CLAIM_SUFFIX)
        .execute(&self.pool)
        .await?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            warn!(reaped = reaped, "Returned stale claims to pending");
        }
        Ok(reaped)
    }

    async fn report(&self, now: DateTime<Utc>) -> Result<QueueReport> {
        let count_rows = sqlx::query_as::<_, StatusCountRow>(
            "SELECT status, COUNT(*) AS total FROM sync_queue_items GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in count_rows {
            match row.status.as_str() {
                "pending" => counts.pending = row.total,
                "claimed" => counts.claimed = row.total,
                "completed" => counts.completed = row.total,
                "failed" => counts.failed = row.total,
                "dead_lettered" => counts.dead_lettered = row.total,
                other => warn!(status = %other, "Unknown status in queue report"),
            }
        }

        let blocked_rows = sqlx::query_as::<_, BlockedCorrelationRow>(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (d.correlation_id)
                    d.correlation_id,
                    d.id AS dead_lettered_item_id,
                    d.sequence AS dead_lettered_sequence,
                    d.table_name,
                    d.record_id,
                    d.last_error,
                    (
                        SELECT COUNT(*) FROM sync_queue_items p
                        WHERE p.correlation_id = d.correlation_id
                          AND p.sequence > d.sequence
                          AND p.status = 'pending'
                    ) AS blocked_items,
                    d.updated_at AS blocked_since
                FROM sync_queue_items d
                WHERE d.status = 'dead_lettered'
                ORDER BY d.correlation_id, d.sequence
            ) heads
            ORDER BY blocked_since, correlation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let blocked_correlations = blocked_rows
            .into_iter()
            .map(|row| BlockedCorrelation {
                correlation_id: row.correlation_id,
                dead_lettered_item_id: row.dead_lettered_item_id,
                dead_lettered_sequence: row.dead_lettered_sequence,
                table_name: row.table_name,
                record_id: row.record_id,
                last_error: row.last_error,
                blocked_items: row.blocked_items,
                blocked_since: row.blocked_since,
            })
            .collect();

        Ok(QueueReport {
            counts,
            blocked_correlations,
            generated_at: Some(now),
        })
    }

    #[instrument(skip(self))]
    async fn requeue_dead_letter(&self, item_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue_items
            SET status = 'pending',
                attempt_count = 0,
                claimed_by = NULL,
                claimed_at = NULL,
                next_attempt_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'dead_lettered'
            "#,
        )
        .bind(item_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(item_id = item_id, "Requeued dead-lettered item");
            return Ok(true);
        }

        match self.get_item(item_id).await? {
            Some(_) => Ok(false),
            None => Err(SyncError::NotFound(item_id)),
        }
    }
}
