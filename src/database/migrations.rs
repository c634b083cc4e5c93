//! # Database Migration System
//!
//! Applies the queue schema in version order and records each applied version
//! in `sync_schema_migrations`.
//!
//! ## Concurrency Control
//!
//! Several server processes may start at once. A PostgreSQL advisory lock
//! serializes them so each migration runs exactly once:
//!
//! ```sql
//! SELECT pg_advisory_lock(7302954402318123)
//! ```
//!
//! ## Migration Discovery
//!
//! Migrations are compiled into the binary from the `migrations/` directory and
//! follow the naming convention `YYYYMMDDHHMMSS_description.sql`.

use crate::error::{Result, SyncError};
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

const LOCK_KEY: i64 = 7302954402318123;

const EMBEDDED: &[(&str, &str)] = &[(
    "20250101000000_create_sync_queue",
    include_str!("../../migrations/20250101000000_create_sync_queue.sql"),
)];

/// A single schema migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: String,
    /// Human-readable migration name
    pub name: String,
    pub sql: &'static str,
}

/// Runs schema migrations
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply every migration that has not been applied yet
    pub async fn run_all(pool: &PgPool) -> Result<()> {
        let mut conn = pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = Self::run_outstanding(&mut conn).await;

        // Unlock on the same session that took the lock
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    async fn run_outstanding(conn: &mut sqlx::PgConnection) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS sync_schema_migrations (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let applied: HashSet<String> = sqlx::query("SELECT version FROM sync_schema_migrations")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect();

        for migration in Self::migrations()?.into_values() {
            if applied.contains(&migration.version) {
                debug!(version = %migration.version, "Migration already applied");
                continue;
            }

            info!(
                version = %migration.version,
                name = %migration.name,
                "Applying migration"
            );
            sqlx::raw_sql(migration.sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    SyncError::Migration(format!("{} failed: {e}", migration.version))
                })?;
            sqlx::query("INSERT INTO sync_schema_migrations (version) VALUES ($1)")
                .bind(&migration.version)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }

    /// Embedded migrations keyed and ordered by version
    pub fn migrations() -> Result<BTreeMap<String, Migration>> {
        let mut migrations = BTreeMap::new();
        for &(filename, sql) in EMBEDDED {
            let (version, name) = Self::parse_migration_filename(filename).ok_or_else(|| {
                SyncError::Migration(format!("Invalid migration filename: {filename}"))
            })?;
            migrations.insert(
                version.clone(),
                Migration { version, name, sql },
            );
        }
        Ok(migrations)
    }

    /// Parse migration filename to extract version and name
    fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
        // At least 14 digits + underscore
        if filename.len() < 15 || !filename.is_char_boundary(14) {
            return None;
        }

        let (version_part, name_part) = filename.split_at(14);
        if !version_part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let name = name_part.strip_prefix('_')?.replace('_', " ");
        Some((version_part.to_string(), name))
    }
}
