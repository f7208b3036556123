//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that probes the content and metadata backends

use crate::services::transfer_service::TransferService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Cheap liveness probe, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Writes, reads back and deletes a probe object in the content backend.
/// 2. Looks up a random record in the metadata repository.
///
/// HTTP 200 when both pass, HTTP 503 otherwise.
pub async fn readyz(State(service): State<TransferService>) -> impl IntoResponse {
    let storage_check = match service.check_storage().await {
        Ok(()) => CheckStatus::ok(service.storage_kind()),
        Err(e) => CheckStatus::failed(service.storage_kind(), e.to_string()),
    };
    let metadata_check = match service.check_metadata().await {
        Ok(()) => CheckStatus::ok(service.metadata_kind()),
        Err(e) => CheckStatus::failed(service.metadata_kind(), e.to_string()),
    };

    let overall_ok = storage_check.ok && metadata_check.ok;
    if !overall_ok {
        tracing::warn!(
            storage = ?storage_check.error,
            metadata = ?metadata_check.error,
            "readiness check failed"
        );
    }

    let mut checks = HashMap::new();
    checks.insert("storage", storage_check);
    checks.insert("metadata", metadata_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    backend: &'static str,
    error: Option<String>,
}

impl CheckStatus {
    fn ok(backend: &'static str) -> Self {
        Self {
            ok: true,
            backend,
            error: None,
        }
    }

    fn failed(backend: &'static str, error: String) -> Self {
        Self {
            ok: false,
            backend,
            error: Some(error),
        }
    }
}
