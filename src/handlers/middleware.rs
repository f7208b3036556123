use crate::{errors::AppError, services::transfer_service::TransferService};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

/// Reject peers refused by the server-wide address filter before routing.
pub async fn ip_filter(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if service.admits(remote.ip()) {
        return next.run(request).await;
    }
    tracing::warn!(%remote, path = %request.uri().path(), "address refused by ip filter");
    AppError::new(StatusCode::FORBIDDEN, "Forbidden").into_response()
}
