use crate::services::{
    storage::StorageError,
    transfer_service::{DenyReason, TransferError},
};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

const BASIC_CHALLENGE: &str = "Basic realm=\"Restricted\"";

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(BASIC_CHALLENGE),
            );
        }
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LengthMismatch { .. } | StorageError::InvalidKey => {
                AppError::bad_request(err.to_string())
            }
            other => {
                tracing::error!(error = %other, "storage backend failure");
                AppError::internal("storage backend failure")
            }
        }
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        match err {
            // Expired and exhausted resources look exactly like missing ones.
            TransferError::NotFound | TransferError::Expired | TransferError::QuotaExceeded => {
                AppError::not_found("Not Found")
            }
            TransferError::AuthDenied(
                reason @ (DenyReason::ServerAuth | DenyReason::Credentials | DenyReason::ApiRejected),
            ) => AppError::new(StatusCode::UNAUTHORIZED, reason.to_string()),
            TransferError::AuthDenied(reason) => {
                AppError::new(StatusCode::FORBIDDEN, reason.to_string())
            }
            TransferError::RateLimited => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            TransferError::TooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            TransferError::InvalidFilename | TransferError::InvalidPolicy(_) => {
                AppError::bad_request(err.to_string())
            }
            TransferError::Backend(inner) => inner.into(),
        }
    }
}
