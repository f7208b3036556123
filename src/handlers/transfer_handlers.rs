//! HTTP handlers for uploading, fetching and deleting shared files.
//! Bodies are streamed in both directions. Uploads without a
//! `Content-Length` and multipart file parts are buffered, bounded by the
//! configured upload limit.

use crate::{
    errors::AppError,
    models::metadata::Metadata,
    services::{
        auth::Credentials,
        storage::{ByteStream, body_from_bytes},
        transfer_service::{
            ClientInfo, TransferService, UploadPolicy, UploadReceipt, UploadRequest,
        },
    },
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::Utc;
use futures::StreamExt;
use std::{io, net::SocketAddr};

const MAX_DOWNLOADS: &str = "max-downloads";
const MAX_DAYS: &str = "max-days";
const AUTH_USER: &str = "auth-user";
const AUTH_PASSWORD: &str = "auth-password";
const ALLOWED_IPS: &str = "allowed-ips";
const API_AUTH: &str = "api-auth";

const X_URL_DELETE: HeaderName = HeaderName::from_static("x-url-delete");
const X_REMAINING_DOWNLOADS: HeaderName = HeaderName::from_static("x-remaining-downloads");
const X_REMAINING_DAYS: HeaderName = HeaderName::from_static("x-remaining-days");

/// How a download is presented to the browser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposition {
    Attachment,
    Inline,
}

impl Disposition {
    fn from_action(action: &str) -> Option<Self> {
        match action {
            "download" | "get" => Some(Self::Attachment),
            "inline" => Some(Self::Inline),
            _ => None,
        }
    }
}

/// Upload to `/{filename}`.
pub async fn put_file(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    upload(&service, remote, filename, &headers, body).await
}

/// Upload to a fixed route such as `/healthz`; the path is the filename.
pub async fn put_file_at_route(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let filename = uri.path().trim_start_matches('/').to_string();
    upload(&service, remote, filename, &headers, body).await
}

/// Upload to `/put/{filename}` or `/upload/{filename}`.
pub async fn put_file_prefixed(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((prefix, filename)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if !matches!(prefix.as_str(), "put" | "upload") {
        return Err(AppError::not_found("Not Found"));
    }
    upload(&service, remote, filename, &headers, body).await
}

async fn upload(
    service: &TransferService,
    remote: SocketAddr,
    filename: String,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let policy = upload_policy(headers)?;
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string);

    let (content_length, body) = match declared_length(headers)? {
        Some(length) => (length, byte_stream(body)),
        None => {
            let limit = service
                .max_upload_size()
                .and_then(|limit| usize::try_from(limit).ok())
                .unwrap_or(usize::MAX);
            let data = axum::body::to_bytes(body, limit).await.map_err(|_| {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "upload body too large")
            })?;
            (data.len() as u64, body_from_bytes(data))
        }
    };

    let request = UploadRequest {
        filename,
        content_type,
        content_length,
        body,
        policy,
    };
    let receipt = service.upload(request, &client_info(remote, headers)).await?;
    Ok(upload_response(headers, &[receipt]))
}

/// Multipart upload to `/`. Every file part lands under one token.
pub async fn post_files(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let policy = upload_policy(&headers)?;
    let limit = service.max_upload_size();

    let mut requests = Vec::new();
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        // Plain form values carry no file.
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            data.extend_from_slice(&chunk);
            if limit.is_some_and(|limit| data.len() as u64 > limit) {
                return Err(AppError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("file `{filename}` is too large"),
                ));
            }
        }

        let data = data.freeze();
        requests.push(UploadRequest {
            filename,
            content_type,
            content_length: data.len() as u64,
            body: body_from_bytes(data),
            policy: policy.clone(),
        });
    }
    if requests.is_empty() {
        return Err(AppError::bad_request("no files in upload"));
    }

    let receipts = service
        .upload_many(requests, &client_info(remote, &headers))
        .await?;
    Ok(upload_response(&headers, &receipts))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// One download URL per line; one `x-url-delete` header per file.
fn upload_response(headers: &HeaderMap, receipts: &[UploadReceipt]) -> Response {
    let base = base_url(headers);
    let mut body = String::new();
    let mut delete_urls = Vec::with_capacity(receipts.len());
    for receipt in receipts {
        let url = format!(
            "{base}/{}/{}",
            receipt.token,
            escape_segment(&receipt.filename)
        );
        delete_urls.push(format!("{url}/{}", receipt.deletion_token));
        body.push_str(&url);
        body.push('\n');
    }

    let mut response = (StatusCode::OK, body).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    for delete_url in delete_urls {
        if let Ok(value) = HeaderValue::from_str(&delete_url) {
            response_headers.append(X_URL_DELETE, value);
        }
    }
    response
}

/// Download `/{token}/{filename}` as an attachment.
pub async fn get_file(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((token, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    download(&service, remote, &token, &filename, &headers, Disposition::Attachment).await
}

/// Download `/{download|get|inline}/{token}/{filename}`.
pub async fn get_file_with_action(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((action, token, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let disposition =
        Disposition::from_action(&action).ok_or_else(|| AppError::not_found("Not Found"))?;
    download(&service, remote, &token, &filename, &headers, disposition).await
}

async fn download(
    service: &TransferService,
    remote: SocketAddr,
    token: &str,
    filename: &str,
    headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, AppError> {
    let download = service
        .download(token, filename, &client_info(remote, headers))
        .await?;

    let mut response = Response::new(Body::from_stream(download.object.body));
    set_resource_headers(
        response.headers_mut(),
        &download.object.content_type,
        download.object.content_length,
        &download.metadata,
        filename,
        disposition,
    );
    Ok(response)
}

/// `HEAD /{token}/{filename}`
pub async fn head_file(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((token, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    head(&service, remote, &token, &filename, &headers, Disposition::Attachment).await
}

/// `HEAD /{download|get|inline}/{token}/{filename}`
pub async fn head_file_with_action(
    State(service): State<TransferService>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((action, token, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let disposition =
        Disposition::from_action(&action).ok_or_else(|| AppError::not_found("Not Found"))?;
    head(&service, remote, &token, &filename, &headers, disposition).await
}

async fn head(
    service: &TransferService,
    remote: SocketAddr,
    token: &str,
    filename: &str,
    headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, AppError> {
    let head = service
        .head(token, filename, &client_info(remote, headers))
        .await?;

    let mut response = Response::new(Body::empty());
    set_resource_headers(
        response.headers_mut(),
        &head.info.content_type,
        head.info.content_length,
        &head.metadata,
        filename,
        disposition,
    );
    Ok(response)
}

/// `DELETE /{token}/{filename}/{deletion_token}`
pub async fn delete_file(
    State(service): State<TransferService>,
    Path((token, filename, deletion_token)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&token, &filename, &deletion_token).await?;
    Ok(StatusCode::OK)
}

fn set_resource_headers(
    headers: &mut HeaderMap,
    content_type: &str,
    content_length: u64,
    metadata: &Metadata,
    filename: &str,
    disposition: Disposition,
) {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

    let kind = match disposition {
        Disposition::Attachment => "attachment",
        Disposition::Inline => "inline",
    };
    let quoted = filename.replace('\\', "\\\\").replace('"', "\\\"");
    let value = HeaderValue::from_str(&format!("{kind}; filename=\"{quoted}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);

    let remaining_downloads = metadata
        .remaining_downloads()
        .map_or_else(|| "n/a".to_string(), |n| n.to_string());
    let remaining_days = metadata
        .remaining_days(Utc::now())
        .map_or_else(|| "n/a".to_string(), |n| n.to_string());
    if let Ok(value) = HeaderValue::from_str(&remaining_downloads) {
        headers.insert(X_REMAINING_DOWNLOADS, value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining_days) {
        headers.insert(X_REMAINING_DAYS, value);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_count(headers: &HeaderMap, name: &str) -> Result<u64, AppError> {
    match header_str(headers, name) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| AppError::bad_request(format!("invalid {name} header `{value}`"))),
        None => Ok(0),
    }
}

fn upload_policy(headers: &HeaderMap) -> Result<UploadPolicy, AppError> {
    let credentials = match (
        header_str(headers, AUTH_USER),
        header_str(headers, AUTH_PASSWORD),
    ) {
        (Some(user), Some(password)) => Some(Credentials::new(user, password)),
        (None, None) => None,
        _ => {
            return Err(AppError::bad_request(
                "auth-user and auth-password must be sent together",
            ));
        }
    };

    let allowed = header_str(headers, ALLOWED_IPS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let require_api = header_str(headers, API_AUTH)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");

    Ok(UploadPolicy {
        max_downloads: parse_count(headers, MAX_DOWNLOADS)?,
        max_days: parse_count(headers, MAX_DAYS)?,
        credentials,
        allowed,
        require_api,
    })
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, AppError> {
    header_str(headers, header::CONTENT_LENGTH.as_str())
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| AppError::bad_request("invalid content-length"))
        })
        .transpose()
}

fn byte_stream(body: Body) -> ByteStream {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
        .boxed()
}

fn client_info(remote: SocketAddr, headers: &HeaderMap) -> ClientInfo {
    let credentials = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(Credentials::from_basic_authorization);
    ClientInfo::new(remote.to_string()).with_credentials(credentials)
}

/// Scheme and host the client used to reach us.
fn base_url(headers: &HeaderMap) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, header::HOST.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Percent-encode everything outside the unreserved set.
fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
