//! # Health Check Handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::database::DatabaseConnection;
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    environment: String,
    version: String,
    /// `None` when the engine runs without a database
    database: Option<String>,
}

/// Health check endpoint: GET /health
///
/// Reports `ok` when the process is up and, if a database pool is configured,
/// the database answers. Returns 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.database_pool {
        Some(pool) => match DatabaseConnection::from_pool(pool.clone()).health_check().await {
            Ok(true) => Some("ok".to_string()),
            Ok(false) => Some("unavailable".to_string()),
            Err(e) => {
                error!("Database health check failed: {}", e);
                Some("unavailable".to_string())
            }
        },
        None => None,
    };

    let healthy = database.as_deref().map_or(true, |status| status == "ok");
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            environment: state.environment.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
        }),
    )
}
