//! End-to-end checks of the HTTP surface, driven through the router without
//! binding a socket.

use axum::{
    Router,
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, Response, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose};
use ephemeral_transfer::{
    routes::routes::routes,
    services::{
        auth::{Authenticator, StaticCredentials},
        ip_filter::{IpFilter, IpFilterOptions},
        metadata::StorageMetadataRepository,
        rate_limiter::RateLimiter,
        storage::{Storage, local::LocalStorage, memory::MemoryStorage},
        transfer_service::TransferService,
    },
};
use http_body_util::BodyExt;
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceExt;

const HOST: &str = "files.test";

fn memory_service() -> TransferService {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let metadata = Arc::new(StorageMetadataRepository::new(storage.clone()));
    TransferService::new(storage, metadata)
}

fn app_for(service: &TransferService, peer: [u8; 4]) -> Router {
    routes(service.clone(), &[]).layer(MockConnectInfo(SocketAddr::from((peer, 40000))))
}

fn app(service: &TransferService) -> Router {
    app_for(service, [127, 0, 0, 1])
}

async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn put(path: &str, data: &'static str) -> axum::http::request::Builder {
    Request::builder()
        .method("PUT")
        .uri(path)
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, data.len())
}

fn get(path: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(path)
}

fn basic(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{user}:{password}"))
    )
}

/// Upload and return `(resource path, delete path)`.
async fn upload(app: Router, request: Request<Body>) -> (String, String) {
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let delete_url = response
        .headers()
        .get("x-url-delete")
        .expect("delete url header")
        .to_str()
        .unwrap()
        .to_string();
    let url = body_string(response).await;
    let prefix = format!("http://{HOST}");

    let path = url
        .trim_end()
        .strip_prefix(&prefix)
        .expect("url uses the request host")
        .to_string();
    let delete_path = delete_url.strip_prefix(&prefix).unwrap().to_string();
    (path, delete_path)
}

#[tokio::test]
async fn upload_then_download_respects_quota() {
    let service = memory_service();
    let (path, _) = upload(
        app(&service),
        put("/report.pdf", "hello")
            .header("Max-Downloads", "1")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert!(path.ends_with("/report.pdf"));

    let response = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(response.headers()["x-remaining-downloads"], "0");
    assert_eq!(response.headers()["x-remaining-days"], "n/a");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"report.pdf\""
    );
    assert_eq!(body_string(response).await, "hello");

    let second = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn head_and_inline_download() {
    let service = memory_service();
    let (path, _) = upload(
        app(&service),
        put("/put/notes.txt", "hello")
            .header("Max-Downloads", "2")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;

    for _ in 0..3 {
        let head = send(
            app(&service),
            Request::builder()
                .method("HEAD")
                .uri(&path)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(head.headers()["x-remaining-downloads"], "2");
        assert!(body_string(head).await.is_empty());
    }

    let inline = send(
        app(&service),
        get(&format!("/inline{path}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(inline.status(), StatusCode::OK);
    assert_eq!(
        inline.headers()[header::CONTENT_DISPOSITION],
        "inline; filename=\"notes.txt\""
    );
    assert_eq!(inline.headers()["x-remaining-downloads"], "1");

    let unknown_action = send(
        app(&service),
        get(&format!("/preview{path}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(unknown_action.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_without_content_length_is_buffered() {
    let service = memory_service();
    let request = Request::builder()
        .method("PUT")
        .uri("/upload/chunked.bin")
        .header(header::HOST, HOST)
        .body(Body::from("abc"))
        .unwrap();
    let (path, _) = upload(app(&service), request).await;

    let response = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(body_string(response).await, "abc");
}

#[tokio::test]
async fn delete_requires_the_deletion_token() {
    let service = memory_service();
    let (path, delete_path) = upload(
        app(&service),
        put("/a.txt", "hello").body(Body::from("hello")).unwrap(),
    )
    .await;
    assert!(delete_path.starts_with(&path));

    let wrong = send(
        app(&service),
        Request::builder()
            .method("DELETE")
            .uri(format!("{path}/not-the-token"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    let deleted = send(
        app(&service),
        Request::builder()
            .method("DELETE")
            .uri(&delete_path)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(deleted.status(), StatusCode::OK);

    let gone = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ip_restricted_resource() {
    let service = memory_service();
    let (path, _) = upload(
        app(&service),
        put("/secret.txt", "hello")
            .header("Allowed-Ips", "10.0.0.5")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;

    let refused = send(
        app_for(&service, [10, 0, 0, 6]),
        get(&path).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(refused.status(), StatusCode::FORBIDDEN);

    let allowed = send(
        app_for(&service, [10, 0, 0, 5]),
        get(&path).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn credential_protected_resource() {
    let service = memory_service();
    let (path, _) = upload(
        app(&service),
        put("/private.txt", "hello")
            .header("Auth-User", "alice")
            .header("Auth-Password", "secret")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;

    let anonymous = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        anonymous.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"Restricted\""
    );

    let wrong = send(
        app(&service),
        get(&path)
            .header(header::AUTHORIZATION, basic("alice", "wrong"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = send(
        app(&service),
        get(&path)
            .header(header::AUTHORIZATION, basic("alice", "secret"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_string(ok).await, "hello");
}

#[tokio::test]
async fn server_credentials_guard_uploads() {
    let service = memory_service().with_authenticator(Authenticator::Static(
        StaticCredentials::new("admin", "hunter2"),
    ));

    let refused = send(
        app(&service),
        put("/a.txt", "x").body(Body::from("x")).unwrap(),
    )
    .await;
    assert_eq!(refused.status(), StatusCode::UNAUTHORIZED);

    let (path, _) = upload(
        app(&service),
        put("/a.txt", "x")
            .header(header::AUTHORIZATION, basic("admin", "hunter2"))
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    let download = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(download.status(), StatusCode::OK);
}

#[tokio::test]
async fn global_ip_filter_runs_before_routing() {
    let filter = IpFilter::new(&IpFilterOptions {
        allowed: vec!["10.0.0.5".into()],
        blocked: vec![],
        block_by_default: true,
    })
    .unwrap();
    let service = memory_service().with_ip_filter(Some(filter));

    let refused = send(
        app_for(&service, [10, 0, 0, 6]),
        get("/healthz").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(refused.status(), StatusCode::FORBIDDEN);

    let admitted = send(
        app_for(&service, [10, 0, 0, 5]),
        get("/healthz").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(admitted.status(), StatusCode::OK);
}

#[tokio::test]
async fn downloads_are_rate_limited() {
    let service =
        memory_service().with_rate_limiter(Some(Arc::new(RateLimiter::per_minute(1))));
    let (path, _) = upload(
        app(&service),
        put("/a.txt", "x").body(Body::from("x")).unwrap(),
    )
    .await;

    let first = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn malformed_policy_headers_are_bad_requests() {
    let service = memory_service();
    let response = send(
        app(&service),
        put("/a.txt", "x")
            .header("Max-Days", "soon")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        app(&service),
        put("/a.txt", "x")
            .header("Allowed-Ips", "10.0.0.300")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoints_on_local_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
    let metadata = Arc::new(StorageMetadataRepository::new(storage.clone()));
    let service = TransferService::new(storage, metadata);

    let live = send(app(&service), get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(live.status(), StatusCode::OK);

    let ready = send(app(&service), get("/readyz").body(Body::empty()).unwrap()).await;
    assert_eq!(ready.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(ready).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["storage"]["backend"], "local");

    let (path, _) = upload(
        app(&service),
        put("/on-disk.txt", "hello").body(Body::from("hello")).unwrap(),
    )
    .await;
    let response = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(body_string(response).await, "hello");
}

const BOUNDARY: &str = "transfer-test-boundary";

/// `(field name, filename, content type, data)` parts as a multipart body.
fn multipart_body(parts: &[(&str, Option<&str>, &str, &str)]) -> String {
    let mut body = String::new();
    for (name, filename, content_type, data) in parts {
        body.push_str(&format!("--{BOUNDARY}\r\n"));
        match filename {
            Some(filename) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
            )),
            None => body.push_str(&format!("Content-Disposition: form-data; name=\"{name}\"\r\n")),
        }
        body.push_str(&format!("Content-Type: {content_type}\r\n\r\n{data}\r\n"));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn post_form(body: String) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::HOST, HOST)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_LENGTH, body.len())
}

#[tokio::test]
async fn form_upload_groups_files_under_one_token() {
    let service = memory_service();
    let body = multipart_body(&[
        ("file", Some("a.txt"), "text/plain", "first"),
        ("note", None, "text/plain", "not a file"),
        ("file", Some("b.csv"), "text/csv", "x,y"),
    ]);
    let response = send(
        app(&service),
        post_form(body.clone())
            .header("Max-Downloads", "1")
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let prefix = format!("http://{HOST}");
    let delete_paths: Vec<String> = response
        .headers()
        .get_all("x-url-delete")
        .iter()
        .map(|v| v.to_str().unwrap().strip_prefix(&prefix).unwrap().to_string())
        .collect();
    let text = body_string(response).await;
    let paths: Vec<&str> = text
        .lines()
        .map(|line| line.strip_prefix(&prefix).unwrap())
        .collect();
    assert_eq!(paths.len(), 2);
    assert_eq!(delete_paths.len(), 2);

    let token = |path: &str| path.split('/').nth(1).unwrap().to_string();
    assert_eq!(token(paths[0]), token(paths[1]));
    assert!(paths[0].ends_with("/a.txt"));
    assert!(paths[1].ends_with("/b.csv"));

    let csv = send(app(&service), get(paths[1]).body(Body::empty()).unwrap()).await;
    assert_eq!(csv.status(), StatusCode::OK);
    assert_eq!(csv.headers()[header::CONTENT_TYPE], "text/csv");
    assert_eq!(body_string(csv).await, "x,y");

    // The policy headers apply to every file.
    let again = send(app(&service), get(paths[1]).body(Body::empty()).unwrap()).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    let deleted = send(
        app(&service),
        Request::builder()
            .method("DELETE")
            .uri(&delete_paths[0])
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let gone = send(app(&service), get(paths[0]).body(Body::empty()).unwrap()).await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn form_upload_without_files_is_rejected() {
    let service = memory_service();
    let body = multipart_body(&[("note", None, "text/plain", "no files here")]);
    let response = send(
        app(&service),
        post_form(body.clone()).body(Body::from(body)).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn form_upload_requires_server_credentials() {
    let service = memory_service().with_authenticator(Authenticator::Static(
        StaticCredentials::new("admin", "hunter2"),
    ));
    let body = multipart_body(&[("file", Some("a.txt"), "text/plain", "x")]);

    let denied = send(
        app(&service),
        post_form(body.clone())
            .body(Body::from(body.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = send(
        app(&service),
        post_form(body.clone())
            .header(header::AUTHORIZATION, basic("admin", "hunter2"))
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn form_upload_enforces_the_size_limit() {
    let service = memory_service().with_max_upload_size(Some(4));
    let body = multipart_body(&[("file", Some("big.txt"), "text/plain", "more than four")]);
    let response = send(
        app(&service),
        post_form(body.clone()).body(Body::from(body)).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn files_may_be_named_like_health_routes() {
    let service = memory_service();
    for name in ["healthz", "readyz"] {
        let (path, _) = upload(
            app(&service),
            put(&format!("/{name}"), "hello")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;
        assert!(path.ends_with(&format!("/{name}")));

        let response = send(app(&service), get(&path).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello");
    }

    let health = send(app(&service), get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(health.status(), StatusCode::OK);
}
