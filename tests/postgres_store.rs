//! PostgreSQL queue store tests. Run with `--features test-database` and a
//! `DATABASE_URL` pointing at a server the tests may create databases on.
#![cfg(feature = "test-database")]

use chrono::{Duration as ChronoDuration, Utc};
use outbox_sync::database::{DatabaseConnection, DatabaseMigrations};
use outbox_sync::enqueue::{prepare_items, EnqueueItem};
use outbox_sync::error::SyncError;
use outbox_sync::models::{NewRecordLink, QueueItemStatus};
use outbox_sync::store::{PgQueueStore, QueueStore};
use serde_json::json;
use sqlx::PgPool;

async fn store(pool: PgPool) -> PgQueueStore {
    DatabaseMigrations::run_all(&pool).await.unwrap();
    PgQueueStore::new(pool)
}

fn booking() -> Vec<EnqueueItem> {
    vec![
        EnqueueItem::create("proposal", "p-1", json!({"title": "Loft"})),
        EnqueueItem::update("guest", "g-1", json!({"proposal": "p-1"})).depends_on("p-1"),
        EnqueueItem::update("host", "h-1", json!({"proposal": "p-1"})).depends_on("p-1"),
    ]
}

#[sqlx::test(migrations = false)]
async fn test_migrations_are_idempotent(pool: PgPool) {
    DatabaseMigrations::run_all(&pool).await.unwrap();
    DatabaseMigrations::run_all(&pool).await.unwrap();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_schema_migrations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(applied, 1);
}

#[sqlx::test(migrations = false)]
async fn test_insert_is_idempotent_and_ordered(pool: PgPool) {
    let store = store(pool).await;
    let now = Utc::now();

    let first = store
        .insert_items(prepare_items("p-1", booking()).unwrap(), now)
        .await
        .unwrap();
    let second = store
        .insert_items(prepare_items("p-1", booking()).unwrap(), now)
        .await
        .unwrap();
    assert_eq!((first.enqueued, first.duplicates), (3, 0));
    assert_eq!((second.enqueued, second.duplicates), (0, 3));

    let items = store.list_correlation("p-1").await.unwrap();
    assert_eq!(
        items.iter().map(|i| i.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(items[1].depends_on_external_id_of.as_deref(), Some("p-1"));
}

#[sqlx::test(migrations = false)]
async fn test_conflicting_sequence_is_rejected(pool: PgPool) {
    let store = store(pool).await;
    store
        .insert_items(prepare_items("p-1", booking()).unwrap(), Utc::now())
        .await
        .unwrap();

    let other = prepare_items(
        "p-1",
        vec![EnqueueItem::create("invoice", "i-1", json!({}))],
    )
    .unwrap();
    let result = store.insert_items(other, Utc::now()).await;
    assert!(matches!(
        result,
        Err(SyncError::SequenceConflict { sequence: 1, .. })
    ));
}

#[sqlx::test(migrations = false)]
async fn test_claims_take_heads_and_respect_fencing(pool: PgPool) {
    let store = store(pool).await;
    let now = Utc::now();
    store
        .insert_items(prepare_items("p-1", booking()).unwrap(), now)
        .await
        .unwrap();
    store
        .insert_items(
            prepare_items("p-2", vec![EnqueueItem::create("note", "n-1", json!({}))]).unwrap(),
            now,
        )
        .await
        .unwrap();

    let claimed = store.claim_batch("w-1", 10, now).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|item| item.sequence == 1));
    assert!(claimed.iter().all(|item| item.attempt_count == 1));

    // Nothing left: the next items wait on their heads
    assert!(store.claim_batch("w-2", 10, now).await.unwrap().is_empty());

    let head = claimed
        .iter()
        .find(|item| item.correlation_id == "p-1")
        .unwrap();
    assert!(!store
        .mark_completed(head.id, "w-2", Some("X"), now)
        .await
        .unwrap());
    assert!(store
        .mark_completed(head.id, "w-1", Some("X"), now)
        .await
        .unwrap());

    let next = store
        .claim_next_in_correlation("w-1", "p-1", now)
        .await
        .unwrap()
        .expect("sequence 2 is due");
    assert_eq!(next.sequence, 2);
    assert_eq!(next.claimed_by.as_deref(), Some("w-1"));

    let stored = store.get_item(head.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueItemStatus::Completed);
    assert_eq!(stored.external_id.as_deref(), Some("X"));
}

#[sqlx::test(migrations = false)]
async fn test_retry_release_and_dead_letter_transitions(pool: PgPool) {
    let store = store(pool).await;
    let now = Utc::now();
    store
        .insert_items(prepare_items("p-1", booking()).unwrap(), now)
        .await
        .unwrap();

    let head = store.claim_batch("w-1", 1, now).await.unwrap().remove(0);
    let later = now + ChronoDuration::minutes(1);
    assert!(store
        .schedule_retry(head.id, "w-1", later, "attempt 1: 503", now)
        .await
        .unwrap());

    // Not due yet
    assert!(store.claim_batch("w-1", 1, now).await.unwrap().is_empty());

    let head = store.claim_batch("w-1", 1, later).await.unwrap().remove(0);
    assert_eq!(head.attempt_count, 2);
    assert!(store
        .release_claim(head.id, "w-1", "waiting", later)
        .await
        .unwrap());
    let released = store.get_item(head.id).await.unwrap().unwrap();
    assert_eq!(released.status, QueueItemStatus::Pending);
    assert_eq!(released.attempt_count, 1);

    let head = store.claim_batch("w-1", 1, later).await.unwrap().remove(0);
    assert!(store
        .dead_letter(head.id, "w-1", "attempt 2: 400", later)
        .await
        .unwrap());

    let report = store.report(later).await.unwrap();
    assert_eq!(report.counts.dead_lettered, 1);
    assert_eq!(report.counts.pending, 2);
    let blocked = report.oldest_blocked().unwrap();
    assert_eq!(blocked.correlation_id, "p-1");
    assert_eq!(blocked.blocked_items, 2);

    assert!(store.requeue_dead_letter(head.id, later).await.unwrap());
    assert!(!store.requeue_dead_letter(head.id, later).await.unwrap());
    let requeued = store.get_item(head.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, QueueItemStatus::Pending);
    assert_eq!(requeued.attempt_count, 0);
}

#[sqlx::test(migrations = false)]
async fn test_stale_claims_are_reaped(pool: PgPool) {
    let store = store(pool).await;
    let long_ago = Utc::now() - ChronoDuration::hours(1);
    store
        .insert_items(prepare_items("p-1", booking()).unwrap(), long_ago)
        .await
        .unwrap();
    let head = store.claim_batch("lost", 1, long_ago).await.unwrap().remove(0);

    let now = Utc::now();
    let reaped = store
        .reap_stale_claims(now - ChronoDuration::minutes(5), now)
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let item = store.get_item(head.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.claimed_by, None);
    assert!(item.last_error.unwrap().contains("lost"));
}

#[sqlx::test(migrations = false)]
async fn test_record_links_are_write_once(pool: PgPool) {
    let store = store(pool).await;
    let link = |external_id: &str| NewRecordLink {
        table_name: "proposal".to_string(),
        record_id: "p-1".to_string(),
        external_id: external_id.to_string(),
        local_patch: Some(json!({"id": external_id})),
        source_item_id: None,
    };

    let first = store.record_link(link("X"), Utc::now()).await.unwrap();
    let second = store.record_link(link("Y"), Utc::now()).await.unwrap();
    assert_eq!(first.external_id, "X");
    assert_eq!(second.external_id, "X");
    assert_eq!(
        store
            .find_link("proposal", "p-1")
            .await
            .unwrap()
            .map(|l| l.external_id),
        Some("X".to_string())
    );
}

#[sqlx::test(migrations = false)]
async fn test_concurrent_record_links_agree_on_first_id(pool: PgPool) {
    let store = store(pool).await;
    let link = |external_id: String| NewRecordLink {
        table_name: "proposal".to_string(),
        record_id: "p-1".to_string(),
        external_id,
        local_patch: None,
        source_item_id: None,
    };

    let writes = (0..8).map(|n| store.record_link(link(format!("X-{n}")), Utc::now()));
    let stored: Vec<_> = futures::future::join_all(writes)
        .await
        .into_iter()
        .map(|result| result.unwrap().external_id)
        .collect();

    let winner = store
        .find_link("proposal", "p-1")
        .await
        .unwrap()
        .unwrap()
        .external_id;
    assert!(stored.iter().all(|id| *id == winner), "{stored:?} vs {winner}");
}

#[sqlx::test(migrations = false)]
async fn test_connection_health_check(pool: PgPool) {
    let connection = DatabaseConnection::from_pool(pool);
    assert!(connection.health_check().await.unwrap());
}

#[sqlx::test(migrations = false)]
async fn test_enqueue_in_transaction_is_invisible_until_commit(pool: PgPool) {
    let store = store(pool.clone()).await;

    let mut tx = pool.begin().await.unwrap();
    let outcome = PgQueueStore::enqueue_in_transaction(&mut tx, "p-1", booking())
        .await
        .unwrap();
    assert_eq!(outcome.enqueued, 3);
    assert!(store.list_correlation("p-1").await.unwrap().is_empty());
    tx.rollback().await.unwrap();
    assert!(store.list_correlation("p-1").await.unwrap().is_empty());

    let mut tx = pool.begin().await.unwrap();
    PgQueueStore::enqueue_in_transaction(&mut tx, "p-1", booking())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.list_correlation("p-1").await.unwrap().len(), 3);
}
