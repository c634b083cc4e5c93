//! # Error Types
//!
//! Structured errors for the sync engine. Each kind maps onto one row of the
//! failure-handling table: validation failures are rejected at enqueue time,
//! mapping and remote failures are classified by [`crate::retry`], and
//! database failures bubble up to whoever invoked the engine.

use std::time::Duration;
use thiserror::Error;

/// Top-level error for every fallible engine operation
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Queue item {0} not found")]
    NotFound(i64),

    #[error("correlation '{correlation_id}' already holds a different item at sequence {sequence}")]
    SequenceConflict {
        correlation_id: String,
        sequence: i32,
    },

    #[error("Worker task failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Malformed enqueue input. Never reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("correlation id must not be empty")]
    EmptyCorrelationId,

    #[error("enqueue requires at least one item")]
    NoItems,

    #[error("item {position}: {field} must not be empty")]
    EmptyField {
        position: usize,
        field: &'static str,
    },

    #[error("item {position}: payload must be a JSON object")]
    PayloadNotObject { position: usize },

    #[error("item {position}: depends on record '{record_id}' which is not an earlier item in the list")]
    UnknownDependency { position: usize, record_id: String },
}

/// A payload that cannot be translated to the remote shape.
///
/// Retrying with the same payload cannot succeed, so these are non-retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("table '{table}' has no mapping")]
    UnknownTable { table: String },

    #[error("table '{table}': required field '{field}' is missing")]
    MissingField { table: String, field: String },

    #[error("table '{table}': field '{field}' cannot be coerced: {reason}")]
    Coercion {
        table: String,
        field: String,
        reason: String,
    },

    #[error("table '{table}': payload references dependency '{record_id}' but no field carries it")]
    UnplacedDependency { table: String, record_id: String },

    #[error("table '{table}': no external id known for record '{record_id}'")]
    MissingExternalId { table: String, record_id: String },

    #[error("table '{table}': payload must be a JSON object")]
    NotAnObject { table: String },
}

/// Failure talking to the remote system, carrying enough detail to classify it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network failure: {0}")]
    Network(String),

    #[error("remote server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("remote rejected request {status}: {body}")]
    Client { status: u16, body: String },

    #[error("remote rate limited the request (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// HTTP status associated with the failure, if the remote answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
