//! # Web API Error Types
//!
//! Error responses for the trigger and operator endpoints. Every error renders
//! as `{"error": {"code": ..., "message": ...}}` with a matching status code.

use crate::error::SyncError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {what}")]
    NotFound { what: String },

    #[error("Invalid request: {message}")]
    BadRequest { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Database operation failed: {operation}")]
    DatabaseError { operation: String },

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn database_error(operation: impl Into<String>) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_code, message) = match &self {
            ApiError::NotFound { what } => (StatusCode::NOT_FOUND, "NOT_FOUND", what.clone()),
            ApiError::BadRequest { message } => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", message.clone())
            }
            ApiError::Conflict { message } => (StatusCode::CONFLICT, "CONFLICT", message.clone()),
            ApiError::DatabaseError { operation } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                operation.clone(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        };

        let error_response = json!({
            "error": {
                "code": error_code,
                "message": message
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(e) => ApiError::bad_request(e.to_string()),
            SyncError::NotFound(id) => ApiError::not_found(format!("queue item {id}")),
            SyncError::SequenceConflict { .. } => ApiError::Conflict {
                message: err.to_string(),
            },
            SyncError::Database(sqlx::Error::PoolTimedOut) => {
                ApiError::database_error("Database pool timed out")
            }
            SyncError::Database(_) => ApiError::database_error("Database operation failed"),
            other => {
                tracing::error!("Unhandled engine error: {}", other);
                ApiError::Internal
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        let cases = [
            (
                SyncError::Validation(ValidationError::NoItems),
                StatusCode::BAD_REQUEST,
            ),
            (SyncError::NotFound(7), StatusCode::NOT_FOUND),
            (
                SyncError::SequenceConflict {
                    correlation_id: "c".to_string(),
                    sequence: 1,
                },
                StatusCode::CONFLICT,
            ),
            (
                SyncError::Worker("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
