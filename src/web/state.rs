//! # Web API Application State

use crate::engine::SyncEngine;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    /// Present when the queue lives in PostgreSQL; used by readiness checks
    pub database_pool: Option<PgPool>,
    pub environment: String,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, environment: impl Into<String>) -> Self {
        Self {
            engine,
            database_pool: None,
            environment: environment.into(),
        }
    }

    pub fn with_database_pool(mut self, pool: PgPool) -> Self {
        self.database_pool = Some(pool);
        self
    }
}
