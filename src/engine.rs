//! # Sync Engine
//!
//! Wires the store, mapping layer, remote client and retry policy into the
//! operations exposed to triggers and operators.
//!
//! ```rust,no_run
//! use outbox_sync::config::SyncConfig;
//! use outbox_sync::engine::SyncEngine;
//! use outbox_sync::mapping::MappingRegistry;
//! use outbox_sync::remote::HttpRemoteClient;
//! use outbox_sync::store::InMemoryQueueStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let engine = SyncEngine::new(
//!     Arc::new(InMemoryQueueStore::new()),
//!     Arc::new(HttpRemoteClient::new(&config.remote)?),
//!     MappingRegistry::permissive(),
//!     &config,
//! );
//!
//! let summary = engine.run_once(None).await?;
//! println!("completed {} of {}", summary.completed, summary.processed);
//! # Ok(())
//! # }
//! ```

use crate::config::SyncConfig;
use crate::dispatcher::{Dispatcher, ProcessSummary};
use crate::enqueue::{EnqueueItem, Enqueuer};
use crate::error::Result;
use crate::mapping::MappingRegistry;
use crate::models::{QueueItem, QueueReport};
use crate::remote::RemoteApi;
use crate::retry::RetryController;
use crate::store::{EnqueueOutcome, QueueStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub struct SyncEngine {
    store: Arc<dyn QueueStore>,
    enqueuer: Enqueuer,
    dispatcher: Dispatcher,
    default_batch_size: usize,
    claim_staleness: Duration,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteApi>,
        mappings: MappingRegistry,
        config: &SyncConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            remote,
            Arc::new(mappings),
            RetryController::new(&config.retry),
            config.dispatcher.clone(),
        );

        Self {
            enqueuer: Enqueuer::new(store.clone()),
            store,
            dispatcher,
            default_batch_size: config.dispatcher.batch_size,
            claim_staleness: config.dispatcher.claim_staleness(),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn enqueue(
        &self,
        correlation_id: &str,
        items: Vec<EnqueueItem>,
    ) -> Result<EnqueueOutcome> {
        self.enqueuer.enqueue(correlation_id, items).await
    }

    /// One trigger invocation: reap lost claims, then dispatch a batch
    #[instrument(skip(self))]
    pub async fn run_once(&self, batch_size: Option<usize>) -> Result<ProcessSummary> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.claim_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let reaped = self.store.reap_stale_claims(now - staleness, now).await?;
        if reaped > 0 {
            warn!(reaped = reaped, "Recovered claims from lost workers");
        }

        self.dispatcher
            .process_batch(batch_size.unwrap_or(self.default_batch_size))
            .await
    }

    pub async fn report(&self) -> Result<QueueReport> {
        self.store.report(Utc::now()).await
    }

    /// Give a dead-lettered item a fresh attempt budget so its correlation can resume
    pub async fn requeue_dead_letter(&self, item_id: i64) -> Result<bool> {
        let requeued = self.store.requeue_dead_letter(item_id, Utc::now()).await?;
        if requeued {
            info!(item_id = item_id, "Dead-lettered item requeued by operator");
        }
        Ok(requeued)
    }

    pub async fn correlation(&self, correlation_id: &str) -> Result<Vec<QueueItem>> {
        self.store.list_correlation(correlation_id).await
    }
}
