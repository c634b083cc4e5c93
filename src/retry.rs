//! # Retry/Backoff Controller
//!
//! Classifies dispatch failures and decides what happens to the item next.
//!
//! ## Classification
//!
//! | Category | Source | Retryable |
//! |---|---|---|
//! | `Mapping` | unmappable or missing field | no |
//! | `Protocol` | 2xx without an id, unexpected status | no |
//! | `RemoteClient` | 4xx other than 429 | no |
//! | `TransientNetwork` | timeout, connection reset | yes |
//! | `RemoteServer` | 5xx | yes |
//! | `RateLimited` | 429, honouring `Retry-After` | yes |
//!
//! Retryable failures go back to `pending` with exponential, jittered backoff
//! until `max_attempts` is reached. Non-retryable failures get a small number
//! of defensive retries (one by default) and are then dead-lettered.
//!
//! ## Failure context
//!
//! [`FailureContext`] is an immutable value threaded through one processing
//! step. Notes are folded in by returning a new context, so nothing shared is
//! mutated while workers run concurrently.

use crate::config::RetryConfig;
use crate::error::{MappingError, RemoteError};
use crate::models::QueueItem;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why an item could not be applied remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    Mapping(MappingError),
    Remote(RemoteError),
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapping(e) => write!(f, "{e}"),
            Self::Remote(e) => write!(f, "{e}"),
        }
    }
}

impl From<MappingError> for DispatchFailure {
    fn from(e: MappingError) -> Self {
        Self::Mapping(e)
    }
}

impl From<RemoteError> for DispatchFailure {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

/// Failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Mapping,
    Protocol,
    RemoteClient,
    TransientNetwork,
    RemoteServer,
    RateLimited,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork | Self::RemoteServer | Self::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mapping => "mapping",
            Self::Protocol => "protocol",
            Self::RemoteClient => "remote_client",
            Self::TransientNetwork => "transient_network",
            Self::RemoteServer => "remote_server",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retry_after_hint: Option<Duration>,
    pub message: String,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Immutable diagnostic context for one processing attempt
#[derive(Debug, Clone, PartialEq)]
pub struct FailureContext {
    pub item_id: i64,
    pub correlation_id: String,
    pub table: String,
    pub record_id: String,
    pub sequence: i32,
    /// Attempt number of the attempt that just failed (1-based)
    pub attempt: u32,
    pub notes: Vec<String>,
}

impl FailureContext {
    pub fn for_item(item: &QueueItem) -> Self {
        Self {
            item_id: item.id,
            correlation_id: item.correlation_id.clone(),
            table: item.table_name.clone(),
            record_id: item.record_id.clone(),
            sequence: item.sequence,
            attempt: item.attempt_count.max(0) as u32,
            notes: Vec::new(),
        }
    }

    /// Return a copy with one more diagnostic note
    pub fn with_note(&self, note: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.notes.push(note.into());
        next
    }

    /// Render the context as the `last_error` column value
    pub fn summary(&self, message: &str) -> String {
        if self.notes.is_empty() {
            format!("attempt {}: {message}", self.attempt)
        } else {
            format!("attempt {}: {message} [{}]", self.attempt, self.notes.join("; "))
        }
    }
}

/// What to do with a failed item
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
        classification: ErrorClassification,
    },
    DeadLetter {
        reason: String,
        classification: ErrorClassification,
    },
}

impl RetryDecision {
    pub fn classification(&self) -> &ErrorClassification {
        match self {
            Self::Retry { classification, .. } | Self::DeadLetter { classification, .. } => {
                classification
            }
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

/// Exponential backoff with a cap and symmetric jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: config.base_backoff(),
            multiplier: config.backoff_multiplier,
            cap: config.max_backoff(),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay with jitter applied, never above the cap
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let secs = (delay.as_secs_f64() * factor).clamp(0.0, self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Classifies failures and schedules re-attempts
#[derive(Debug, Clone)]
pub struct RetryController {
    backoff: BackoffPolicy,
    max_attempts: u32,
    defensive_retries: u32,
}

impl RetryController {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(config),
            max_attempts: config.max_attempts.max(1),
            defensive_retries: config.defensive_retries,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn classify(&self, failure: &DispatchFailure) -> ErrorClassification {
        let (category, retry_after_hint) = match failure {
            DispatchFailure::Mapping(_) => (ErrorCategory::Mapping, None),
            DispatchFailure::Remote(remote) => match remote {
                RemoteError::Timeout(_) | RemoteError::Network(_) => {
                    (ErrorCategory::TransientNetwork, None)
                }
                RemoteError::Server { .. } => (ErrorCategory::RemoteServer, None),
                RemoteError::RateLimited { retry_after } => {
                    (ErrorCategory::RateLimited, *retry_after)
                }
                RemoteError::Client { .. } => (ErrorCategory::RemoteClient, None),
                RemoteError::Protocol(_) => (ErrorCategory::Protocol, None),
            },
        };

        ErrorClassification {
            category,
            retry_after_hint,
            message: failure.to_string(),
        }
    }

    /// Decide the next state of an item whose attempt just failed
    pub fn decide(
        &self,
        context: &FailureContext,
        failure: &DispatchFailure,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let classification = self.classify(failure);
        let attempt = context.attempt;

        if classification.is_retryable() {
            if attempt >= self.max_attempts {
                return RetryDecision::DeadLetter {
                    reason: format!(
                        "retry budget exhausted after {attempt} attempts: {}",
                        classification.message
                    ),
                    classification,
                };
            }
        } else if attempt > self.defensive_retries || attempt >= self.max_attempts {
            return RetryDecision::DeadLetter {
                reason: format!(
                    "non-retryable {} failure: {}",
                    classification.category, classification.message
                ),
                classification,
            };
        }

        let delay = match classification.retry_after_hint {
            Some(hint) => hint.min(self.backoff.cap),
            None => self.backoff.jittered_delay_for(attempt),
        };
        let next_attempt_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));

        RetryDecision::Retry {
            delay,
            next_attempt_at,
            classification,
        }
    }
}
