use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use seatmap_core::StoreError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Validation(String),
    NotFound(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl AppError {
    /// Store failures outside the per-seat paths (snapshots, provisioning).
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { event_id, seat_id } => {
                AppError::NotFound(format!("Seat {} not found in event {}", seat_id, event_id))
            }
            StoreError::Unavailable(msg) => AppError::ServiceUnavailable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Seat store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Seat store unavailable".to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Bodies that are not valid JSON, or do not fit the request type (missing
/// fields, negative ttl), are client errors like any other validation.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}
