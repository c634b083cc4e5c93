//! # Sync Engine Configuration
//!
//! Layered configuration: built-in defaults, then an optional config file
//! (TOML, YAML or JSON by extension), then `SYNC__`-prefixed environment
//! variables using `__` as the nesting separator:
//!
//! ```text
//! SYNC__REMOTE__BASE_URL=https://api.example.com/v1
//! SYNC__RETRY__MAX_ATTEMPTS=7
//! SYNC__DISPATCHER__BATCH_SIZE=50
//! ```
//!
//! `DATABASE_URL` and `SYNC_REMOTE_TOKEN` are honoured last so deployments can
//! keep using the conventional variables.

use crate::error::{Result, SyncError};
use crate::mapping::{MappingRegistry, TableMapping};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub environment: String,
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

/// Remote system endpoint. The bearer credential is provisioned out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout_seconds: u64,
    /// JSON pointer locating the assigned id in a create response
    pub id_pointer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: u64,
    /// Fraction of the computed delay applied as +/- random jitter (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Extra attempts granted to non-retryable failures before dead-lettering
    pub defensive_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub claim_staleness_seconds: u64,
    pub worker_id_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

/// Table mappings for the remote API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Map tables without an entry one-to-one instead of rejecting them
    pub allow_unmapped: bool,
    #[serde(default)]
    pub tables: Vec<TableMapping>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            allow_unmapped: true,
            tables: Vec::new(),
        }
    }
}

impl MappingConfig {
    pub fn registry(&self) -> MappingRegistry {
        MappingRegistry::from_tables(self.tables.clone(), self.allow_unmapped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub level: Option<String>,
    pub json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database: DatabaseConfig::default(),
            remote: RemoteConfig::default(),
            retry: RetryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            mapping: MappingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/outbox_sync_development".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            token: None,
            request_timeout_seconds: 10,
            id_pointer: "/id".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_seconds: 60,
            backoff_multiplier: 3.0,
            max_backoff_seconds: 3600,
            jitter_factor: 0.1,
            defensive_retries: 1,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_concurrency: 8,
            claim_staleness_seconds: 300, // 5 minutes
            worker_id_prefix: "sync-worker".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
        }
    }
}

impl SyncConfig {
    /// Load from defaults, an optional file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process environment.
    /// Useful for tests that must not touch global state.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let defaults = ::config::Config::try_from(&SyncConfig::default())
            .map_err(|e| SyncError::Configuration(format!("Invalid defaults: {e}")))?;

        let mut builder = ::config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let overrides = env.clone();
        builder = builder.add_source(
            ::config::Environment::with_prefix("SYNC")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let mut config: SyncConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        let lookup = |key: &str| match &overrides {
            Some(map) => map.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        if let Some(url) = lookup("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(token) = lookup("SYNC_REMOTE_TOKEN") {
            config.remote.token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SyncError::Configuration(msg.to_string()));

        if self.remote.base_url.trim().is_empty() {
            return invalid("remote.base_url must not be empty");
        }
        if !self.remote.id_pointer.is_empty() && !self.remote.id_pointer.starts_with('/') {
            return invalid("remote.id_pointer must be a JSON pointer starting with '/'");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be between 0.0 and 1.0");
        }
        if self.retry.max_backoff_seconds < self.retry.base_backoff_seconds {
            return invalid("retry.max_backoff_seconds must be >= retry.base_backoff_seconds");
        }
        if self.dispatcher.batch_size == 0 {
            return invalid("dispatcher.batch_size must be at least 1");
        }
        if self.dispatcher.max_concurrency == 0 {
            return invalid("dispatcher.max_concurrency must be at least 1");
        }
        // A claim younger than one remote call may still be in flight
        if self.dispatcher.claim_staleness_seconds <= self.remote.request_timeout_seconds {
            return invalid(
                "dispatcher.claim_staleness_seconds must be greater than remote.request_timeout_seconds",
            );
        }
        if self.scheduler.enabled && self.scheduler.interval_seconds == 0 {
            return invalid("scheduler.interval_seconds must be at least 1");
        }
        for table in &self.mapping.tables {
            table
                .validate()
                .map_err(|e| SyncError::Configuration(format!("mapping: {e}")))?;
        }
        Ok(())
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs(self.base_backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

impl DispatcherConfig {
    pub fn claim_staleness(&self) -> Duration {
        Duration::from_secs(self.claim_staleness_seconds)
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}
