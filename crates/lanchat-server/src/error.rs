use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lanchat_store::StoreError;
use thiserror::Error;

use crate::relay::RelayError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload too large")]
    PayloadTooLarge,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<RelayError> for ServerError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Store(e) => ServerError::Store(e),
            RelayError::Protocol(e) => ServerError::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(StoreError::Protocol(_) | StoreError::InvalidPath(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "Record not found".to_string())
            }
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
