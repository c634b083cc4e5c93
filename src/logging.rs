//! # Structured Logging Module
//!
//! Environment-aware structured logging for the dispatcher and its workers.
//! Every queue transition is logged with correlation id, table, record id and
//! attempt number so an item's history can be reconstructed from logs alone.

use crate::config::LoggingConfig;
use crate::models::QueueItem;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. Safe to call more than once.
pub fn init_structured_logging(environment: &str, config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directive = config
            .level
            .clone()
            .unwrap_or_else(|| default_log_level(environment).to_string());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(environment != "production")
                .with_filter(filter)
                .boxed()
        };

        // A subscriber may already be installed by the embedding application
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(environment = %environment, json = config.json, "Structured logging initialized");
    });
}

/// Log level based on environment
fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "debug",
        _ => "debug",
    }
}

/// Log a queue item transition
pub fn log_transition(item: &QueueItem, transition: &str, worker_id: &str, details: Option<&str>) {
    tracing::info!(
        correlation_id = %item.correlation_id,
        sequence = item.sequence,
        table = %item.table_name,
        record_id = %item.record_id,
        operation = %item.operation,
        attempt = item.attempt_count,
        worker_id = %worker_id,
        transition = %transition,
        details = details,
        "QUEUE_TRANSITION"
    );
}

/// Operator-visible alert raised when an item is dead-lettered
pub fn alert_dead_letter(item: &QueueItem, classification: &str, reason: &str) {
    tracing::error!(
        alert = "dead_letter",
        item_id = item.id,
        correlation_id = %item.correlation_id,
        sequence = item.sequence,
        table = %item.table_name,
        record_id = %item.record_id,
        attempt = item.attempt_count,
        classification = %classification,
        reason = %reason,
        "Queue item dead-lettered; later items in this correlation are blocked"
    );
}
