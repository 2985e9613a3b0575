//! Unified error handling for the control API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ferry_engine::Error as EngineError;
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Storage(_) | EngineError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        EngineError::OperationNotFound(_)
        | EngineError::EntityNotFound { .. }
        | EngineError::ConflictNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DuplicateOperation(_)
        | EngineError::EntityExists { .. }
        | EngineError::InvalidTransition { .. }
        | EngineError::RetriesExhausted { .. }
        | EngineError::NotTerminal(_)
        | EngineError::ConflictAlreadyResolved(_)
        | EngineError::SyncInProgress => StatusCode::CONFLICT,
        EngineError::InvalidConfig(_) | EngineError::Unrecognized(_) => StatusCode::BAD_REQUEST,
        EngineError::Offline => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::Engine(e) => {
                let status = engine_status(e);
                if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
                    tracing::error!("Engine error: {:?}", e);
                    (status, "Storage error".to_string(), Some(e.to_string()))
                } else {
                    tracing::debug!("Engine error: {}", e);
                    (status, e.to_string(), None)
                }
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_engine::SyncStatus;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn engine_errors_map_to_http() {
        assert_eq!(status_of(EngineError::SyncInProgress.into()), StatusCode::CONFLICT);
        assert_eq!(status_of(EngineError::Offline.into()), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_of(EngineError::OperationNotFound("op-1".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::InvalidConfig("batchSize".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(
                EngineError::InvalidTransition {
                    id: "op-1".into(),
                    from: SyncStatus::Pending,
                    to: SyncStatus::Pending,
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(EngineError::Storage("disk full".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn request_errors() {
        assert_eq!(status_of(AppError::BadRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AppError::NotFound("x".into())), StatusCode::NOT_FOUND);
    }
}
