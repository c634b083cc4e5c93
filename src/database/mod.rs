//! # Database Operations
//!
//! Connection pooling and schema migrations for the PostgreSQL queue store.
//!
//! - [`connection`] - pool construction and health checks
//! - [`migrations`] - versioned schema migrations under an advisory lock

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
