//! Engine wiring shared by the integration tests.

use super::mock_remote::MockRemoteApi;
use outbox_sync::config::{RetryConfig, SyncConfig};
use outbox_sync::engine::SyncEngine;
use outbox_sync::enqueue::EnqueueItem;
use outbox_sync::mapping::{MappingRegistry, TableMapping};
use outbox_sync::models::{QueueItem, QueueItemStatus};
use outbox_sync::store::InMemoryQueueStore;
use serde_json::json;
use std::sync::Arc;

/// Retries become due immediately so each trigger makes one more attempt
pub fn immediate_retry_config() -> RetryConfig {
    RetryConfig {
        base_backoff_seconds: 0,
        jitter_factor: 0.0,
        ..RetryConfig::default()
    }
}

pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry = immediate_retry_config();
    config.dispatcher.batch_size = 50;
    config.dispatcher.worker_id_prefix = "test-worker".to_string();
    config
}

/// Guests and hosts carry their remote id in `remote_id`
pub fn booking_mappings() -> MappingRegistry {
    MappingRegistry::permissive()
        .with_table(TableMapping::new("guest").id_field("remote_id"))
        .with_table(TableMapping::new("host").id_field("remote_id"))
}

/// Create a proposal, then point an existing guest and host at it
pub fn booking_items(proposal_id: &str) -> Vec<EnqueueItem> {
    vec![
        EnqueueItem::create(
            "proposal",
            proposal_id,
            json!({"title": "Loft by the river", "nights": 3}),
        ),
        EnqueueItem::update(
            "guest",
            "g-1",
            json!({"remote_id": "guest-remote-7", "proposal": proposal_id}),
        )
        .depends_on(proposal_id),
        EnqueueItem::update(
            "host",
            "h-1",
            json!({"remote_id": "host-remote-3", "proposal": proposal_id}),
        )
        .depends_on(proposal_id),
    ]
}

pub struct TestHarness {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<InMemoryQueueStore>,
    pub remote: Arc<MockRemoteApi>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_remote(config, MockRemoteApi::new())
    }

    pub fn with_remote(config: SyncConfig, remote: MockRemoteApi) -> Self {
        let store = Arc::new(InMemoryQueueStore::new());
        let remote = Arc::new(remote);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            booking_mappings(),
            &config,
        ));
        Self {
            engine,
            store,
            remote,
        }
    }

    /// Items of one correlation in sequence order
    pub async fn correlation(&self, correlation_id: &str) -> Vec<QueueItem> {
        self.engine
            .correlation(correlation_id)
            .await
            .expect("list correlation")
    }

    pub async fn statuses(&self, correlation_id: &str) -> Vec<QueueItemStatus> {
        self.correlation(correlation_id)
            .await
            .into_iter()
            .map(|item| item.status)
            .collect()
    }
}
