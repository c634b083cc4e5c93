//! # Dispatcher
//!
//! Drains due queue items into the remote system.
//!
//! ## Invocation
//!
//! One call to [`Dispatcher::process_batch`] is one worker invocation:
//!
//! 1. Claim the eligible head of up to `batch_size` correlations.
//! 2. Hand each correlation to its own task. Tasks run concurrently, bounded by
//!    `max_concurrency`.
//! 3. Within a task, items run strictly in sequence: map, resolve, call the
//!    remote, then record the outcome. After each completion the task claims
//!    the correlation's next item while the invocation's shared budget lasts.
//! 4. A group stops at the first item that does not complete.
//!
//! The invocation returns once every task has finished. It never waits for
//! new work; the trigger decides when to run again.

use crate::config::DispatcherConfig;
use crate::error::{MappingError, Result, SyncError};
use crate::logging::{alert_dead_letter, log_transition};
use crate::mapping::MappingRegistry;
use crate::models::{QueueItem, SyncOperation};
use crate::remote::{CreatedRecord, RemoteApi};
use crate::resolver::{DependencyResolution, IdResolver};
use crate::retry::{DispatchFailure, FailureContext, RetryController, RetryDecision};
use crate::store::QueueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Counts for one invocation. `processed = completed + failed + dead_lettered`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub processed: usize,
    pub completed: usize,
    /// Failures scheduled for another attempt
    pub failed: usize,
    pub dead_lettered: usize,
}

impl ProcessSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::RetryScheduled => self.failed += 1,
            ItemOutcome::DeadLettered => self.dead_lettered += 1,
            ItemOutcome::Waiting | ItemOutcome::Fenced => return,
        }
        self.processed += 1;
    }

    fn merge(&mut self, other: ProcessSummary) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

/// What happened to one claimed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    RetryScheduled,
    DeadLettered,
    /// Dependency not resolvable yet; claim released without using the attempt
    Waiting,
    /// Claim was lost before the outcome could be recorded
    Fenced,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    remote: Arc<dyn RemoteApi>,
    mappings: Arc<MappingRegistry>,
    resolver: IdResolver,
    retry: RetryController,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteApi>,
        mappings: Arc<MappingRegistry>,
        retry: RetryController,
        config: DispatcherConfig,
    ) -> Self {
        let resolver = IdResolver::new(store.clone(), mappings.clone());
        Self {
            store,
            remote,
            mappings,
            resolver,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn new_worker_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.worker_id_prefix, &suffix[..12])
    }

    /// Run one worker invocation over at most `batch_size` items
    #[instrument(skip(self))]
    pub async fn process_batch(&self, batch_size: usize) -> Result<ProcessSummary> {
        let worker_id = self.new_worker_id();
        if batch_size == 0 {
            return Ok(ProcessSummary::default());
        }

        let heads = self
            .store
            .claim_batch(&worker_id, batch_size, Utc::now())
            .await?;
        if heads.is_empty() {
            debug!(worker_id = %worker_id, "No due queue items");
            return Ok(ProcessSummary::default());
        }

        info!(
            worker_id = %worker_id,
            correlations = heads.len(),
            batch_size = batch_size,
            "Dispatching claimed correlations"
        );

        let budget = Arc::new(AtomicUsize::new(batch_size.saturating_sub(heads.len())));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for head in heads {
            let dispatcher = self.clone();
            let worker_id = worker_id.clone();
            let budget = budget.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Worker(format!("worker pool closed: {e}")))?;
                dispatcher.process_correlation(head, &worker_id, &budget).await
            });
        }

        let mut summary = ProcessSummary::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(group)) => summary.merge(group),
                Ok(Err(e)) => {
                    error!(worker_id = %worker_id, "Correlation processing failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(worker_id = %worker_id, "Correlation task aborted: {}", e);
                    first_error.get_or_insert(SyncError::Worker(e.to_string()));
                }
            }
        }

        info!(
            worker_id = %worker_id,
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "Dispatcher invocation finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Process one correlation from its claimed head until it stops
    async fn process_correlation(
        &self,
        head: QueueItem,
        worker_id: &str,
        budget: &AtomicUsize,
    ) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        let mut item = head;

        loop {
            let outcome = self.process_item(&item, worker_id).await?;
            summary.record(outcome);
            if outcome != ItemOutcome::Completed {
                break;
            }

            if budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err()
            {
                debug!(correlation_id = %item.correlation_id, "Batch budget exhausted");
                break;
            }

            match self
                .store
                .claim_next_in_correlation(worker_id, &item.correlation_id, Utc::now())
                .await?
            {
                Some(next) => item = next,
                None => {
                    budget.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Map, resolve and send one claimed item, then record its outcome
    pub async fn process_item(&self, item: &QueueItem, worker_id: &str) -> Result<ItemOutcome> {
        log_transition(item, "claimed", worker_id, None);

        // A record that already has a link was created by an earlier attempt
        if item.operation == SyncOperation::Create {
            if let Some(link) = self.resolver.existing_link(item).await? {
                info!(
                    correlation_id = %item.correlation_id,
                    record_id = %item.record_id,
                    external_id = %link.external_id,
                    "Record already linked; skipping remote create"
                );
                return self.complete(item, worker_id, Some(&link.external_id)).await;
            }
        }

        let dependency = match self.resolver.resolve_dependency(item).await? {
            DependencyResolution::NotRequired => None,
            DependencyResolution::Resolved(resolved) => Some(resolved),
            DependencyResolution::Unresolved { record_id } => {
                let note = format!("waiting for external id of '{record_id}'");
                if !self
                    .store
                    .release_claim(item.id, worker_id, &note, Utc::now())
                    .await?
                {
                    return Ok(ItemOutcome::Fenced);
                }
                log_transition(item, "waiting", worker_id, Some(&note));
                return Ok(ItemOutcome::Waiting);
            }
        };

        let request = match self.mappings.to_remote_shape(
            &item.table_name,
            item.operation,
            &item.payload,
            dependency.as_ref(),
        ) {
            Ok(request) => request,
            Err(e) => return self.handle_failure(item, worker_id, e.into()).await,
        };

        // The claim may have been reaped while this item waited for a worker slot
        if !self.still_claimed(item, worker_id).await? {
            warn!(
                correlation_id = %item.correlation_id,
                item_id = item.id,
                worker_id = %worker_id,
                "Claim lost before the remote call; not sending"
            );
            return Ok(ItemOutcome::Fenced);
        }

        let sent: std::result::Result<Option<CreatedRecord>, DispatchFailure> =
            match item.operation {
                SyncOperation::Create => self
                    .remote
                    .create(&request.resource, &request.body)
                    .await
                    .map(Some)
                    .map_err(DispatchFailure::from),
                SyncOperation::Update | SyncOperation::Delete => {
                    match self.resolver.resolve_target(item).await? {
                        Some(target) if item.operation == SyncOperation::Update => self
                            .remote
                            .update(&request.resource, &target, &request.body)
                            .await
                            .map(|_| None)
                            .map_err(DispatchFailure::from),
                        Some(target) => self
                            .remote
                            .delete(&request.resource, &target)
                            .await
                            .map(|_| None)
                            .map_err(DispatchFailure::from),
                        None => Err(MappingError::MissingExternalId {
                            table: item.table_name.clone(),
                            record_id: item.record_id.clone(),
                        }
                        .into()),
                    }
                }
            };

        match sent {
            Ok(Some(created)) => {
                let link = self.resolver.record_created(item, &created).await?;
                self.complete(item, worker_id, Some(&link.external_id)).await
            }
            Ok(None) => self.complete(item, worker_id, None).await,
            Err(failure) => self.handle_failure(item, worker_id, failure).await,
        }
    }

    async fn still_claimed(&self, item: &QueueItem, worker_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_item(item.id)
            .await?
            .is_some_and(|current| current.is_claimed_by(worker_id)))
    }

    async fn complete(
        &self,
        item: &QueueItem,
        worker_id: &str,
        external_id: Option<&str>,
    ) -> Result<ItemOutcome> {
        if !self
            .store
            .mark_completed(item.id, worker_id, external_id, Utc::now())
            .await?
        {
            return Ok(ItemOutcome::Fenced);
        }
        log_transition(item, "completed", worker_id, external_id);
        Ok(ItemOutcome::Completed)
    }

    async fn handle_failure(
        &self,
        item: &QueueItem,
        worker_id: &str,
        failure: DispatchFailure,
    ) -> Result<ItemOutcome> {
        let now = Utc::now();
        let context = FailureContext::for_item(item);

        match self.retry.decide(&context, &failure, now) {
            RetryDecision::Retry {
                delay,
                next_attempt_at,
                classification,
            } => {
                let last_error = context
                    .with_note(format!("category={}", classification.category))
                    .summary(&classification.message);
                if !self
                    .store
                    .schedule_retry(item.id, worker_id, next_attempt_at, &last_error, now)
                    .await?
                {
                    return Ok(ItemOutcome::Fenced);
                }
                warn!(
                    correlation_id = %item.correlation_id,
                    table = %item.table_name,
                    record_id = %item.record_id,
                    attempt = item.attempt_count,
                    category = %classification.category,
                    delay_secs = delay.as_secs(),
                    "Retry scheduled: {}",
                    classification.message
                );
                log_transition(item, "retry_scheduled", worker_id, Some(&last_error));
                Ok(ItemOutcome::RetryScheduled)
            }
            RetryDecision::DeadLetter {
                reason,
                classification,
            } => {
                let last_error = context
                    .with_note(format!("category={}", classification.category))
                    .summary(&reason);
                if !self
                    .store
                    .dead_letter(item.id, worker_id, &last_error, now)
                    .await?
                {
                    return Ok(ItemOutcome::Fenced);
                }
                log_transition(item, "dead_lettered", worker_id, Some(&last_error));
                alert_dead_letter(item, classification.category.as_str(), &reason);
                Ok(ItemOutcome::DeadLettered)
            }
        }
    }
}
