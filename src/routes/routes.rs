//! Defines routes for uploading, fetching and deleting shared files.
//!
//! ## Structure
//! - **Upload**
//!   - `POST   /` multipart form, all files under one token
//!   - `PUT    /{filename}`
//!   - `PUT    /{put|upload}/{filename}`
//!
//! - **Fetch**
//!   - `GET    /{token}/{filename}` download as attachment
//!   - `GET    /{download|get|inline}/{token}/{filename}`
//!   - `HEAD`  on both paths, no download is counted
//!
//! - **Delete**
//!   - `DELETE /{token}/{filename}/{deletion_token}`
//!
//! Paths with the same number of segments share one route pattern, so the
//! segment names below are positional; each handler reads them as a tuple.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        middleware::ip_filter,
        transfer_handlers::{
            delete_file, get_file, get_file_with_action, head_file, head_file_with_action,
            post_files, put_file, put_file_at_route, put_file_prefixed,
        },
    },
    services::transfer_service::TransferService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post, put},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router with its state and layers applied.
///
/// The address filter runs before routing, so refused peers never reach a
/// handler. The returned router still needs connection info
/// (`into_make_service_with_connect_info::<SocketAddr>()`).
pub fn routes(service: TransferService, cors_domains: &[String]) -> Router {
    let router = Router::new()
        // health endpoints (mounted at root); files may still be named after them
        .route("/healthz", get(healthz).put(put_file_at_route))
        .route("/readyz", get(readyz).put(put_file_at_route))
        // part sizes are checked against the upload limit while reading
        .route("/", post(post_files).layer(DefaultBodyLimit::disable()))
        .route("/{filename}", put(put_file))
        .route(
            "/{token}/{filename}",
            get(get_file).head(head_file).put(put_file_prefixed),
        )
        .route(
            "/{first}/{second}/{third}",
            get(get_file_with_action)
                .head(head_file_with_action)
                .delete(delete_file),
        )
        .layer(middleware::from_fn_with_state(service.clone(), ip_filter))
        .layer(TraceLayer::new_for_http())
        .with_state(service);

    match cors_layer(cors_domains) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(domains: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = domains
        .iter()
        .filter_map(|domain| match HeaderValue::from_str(domain) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(domain, "ignoring invalid cors origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(Any)
            .expose_headers(Any),
    )
}
