//! # Web API
//!
//! HTTP trigger and operator surface:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/sync/process` | Run one dispatcher invocation |
//! | GET | `/sync/report` | Dead letters and blocked correlations |
//! | GET | `/sync/correlations/:correlation_id` | Inspect one correlation |
//! | POST | `/sync/dead-letters/:item_id/requeue` | Reset a dead letter |
//! | GET | `/health` | Liveness and database check |

pub mod errors;
pub mod handlers;
pub mod state;

pub use errors::{ApiError, ApiResult};
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/sync/process", post(handlers::sync::process))
        .route("/sync/report", get(handlers::sync::report))
        .route(
            "/sync/correlations/:correlation_id",
            get(handlers::sync::correlation),
        )
        .route(
            "/sync/dead-letters/:item_id/requeue",
            post(handlers::sync::requeue_dead_letter),
        )
        .with_state(state)
}
