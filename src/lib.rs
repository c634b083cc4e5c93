#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Outbox Sync
//!
//! Durable, ordered, at-least-once propagation of local database writes to a
//! remote HTTP API.
//!
//! ## Overview
//!
//! Business logic records each remote side effect as a queue item next to its
//! primary write. A dispatcher later claims due items, maps them to the remote
//! shape, resolves ids assigned by earlier creates, calls the remote API and
//! records the outcome. Failures are classified: transient ones are retried
//! with capped exponential backoff, permanent ones are dead-lettered and hold
//! the rest of their correlation for an operator.
//!
//! ## Guarantees
//!
//! - **Ordering**: items of one correlation apply strictly in sequence
//! - **Idempotent enqueue**: re-enqueueing the same event is a no-op
//! - **Write-once ids**: a record's remote id is never overwritten once known
//! - **Exclusive claims**: concurrent workers never process the same item
//!
//! ## Module Organization
//!
//! - [`models`] - queue items, record links and the operator report
//! - [`store`] - the queue store trait with PostgreSQL and in-memory backends
//! - [`database`] - connection pooling and schema migrations
//! - [`enqueue`] - validation, sequencing and idempotency keys
//! - [`mapping`] - pure translation to and from the remote shape
//! - [`remote`] - the remote API boundary
//! - [`resolver`] - dependency and target id resolution
//! - [`retry`] - failure classification and backoff
//! - [`dispatcher`] - claim and process batches
//! - [`engine`] - trigger and operator operations
//! - [`scheduler`] - periodic trigger
//! - [`web`] - HTTP trigger and operator endpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use outbox_sync::config::SyncConfig;
//! use outbox_sync::database::{DatabaseConnection, DatabaseMigrations};
//! use outbox_sync::engine::SyncEngine;
//! use outbox_sync::enqueue::EnqueueItem;
//! use outbox_sync::remote::HttpRemoteClient;
//! use outbox_sync::store::PgQueueStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::load(None)?;
//! let database = DatabaseConnection::new(&config.database).await?;
//! DatabaseMigrations::run_all(database.pool()).await?;
//!
//! let engine = SyncEngine::new(
//!     Arc::new(PgQueueStore::new(database.pool().clone())),
//!     Arc::new(HttpRemoteClient::new(&config.remote)?),
//!     config.mapping.registry(),
//!     &config,
//! );
//!
//! engine
//!     .enqueue(
//!         "booking-42",
//!         vec![
//!             EnqueueItem::create("proposal", "p-1", json!({"title": "Loft"})),
//!             EnqueueItem::create("guest", "g-1", json!({"proposal": "p-1"})).depends_on("p-1"),
//!         ],
//!     )
//!     .await?;
//!
//! let summary = engine.run_once(None).await?;
//! println!("{} items processed", summary.processed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Most behaviour is tested against [`store::InMemoryQueueStore`]. The
//! PostgreSQL store tests need a database and run with
//! `--features test-database`.

pub mod config;
pub mod database;
pub mod dispatcher;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod models;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod web;

pub use config::SyncConfig;
pub use dispatcher::{Dispatcher, ProcessSummary};
pub use engine::SyncEngine;
pub use enqueue::{EnqueueItem, Enqueuer};
pub use error::{MappingError, RemoteError, Result, SyncError, ValidationError};
pub use mapping::{MappingRegistry, TableMapping};
pub use models::{QueueItem, QueueItemStatus, SyncOperation};
pub use remote::{HttpRemoteClient, RemoteApi};
pub use store::{EnqueueOutcome, InMemoryQueueStore, PgQueueStore, QueueStore};
