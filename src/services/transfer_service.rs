//! Upload, download, inspection and deletion of shared resources.
//!
//! `TransferService` ties content storage and metadata together and enforces
//! every access rule: server-wide authentication on upload, the per-resource
//! gates (IP allow list, basic credentials, delegated API check), expiry,
//! download quota and the download rate limit.
//!
//! Download counting is a read-modify-write of the metadata record. It runs
//! under the resource's entry in [`ResourceLocks`], so N concurrent downloads
//! of a resource with quota N all succeed and any further one fails.

use crate::{
    models::{
        metadata::{AuthType, Metadata, parse_remote_ip},
        resource::{generate_deletion_token, generate_token, sanitize_filename},
    },
    services::{
        auth::{ApiAuthenticator, Authenticator, Credentials},
        ip_filter::{IpFilter, parse_ip_entry},
        locks::{DEFAULT_LOCK_SHARDS, ResourceLocks},
        metadata::MetadataRepository,
        rate_limiter::RateLimiter,
        storage::{
            ByteStream, DEFAULT_CONTENT_TYPE, ObjectInfo, Storage, StorageError, StorageResult,
            StoredObject, body_from_bytes, collect_body,
        },
    },
};
use chrono::{Duration, Utc};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Which gate turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Server-wide authenticator rejected the uploader.
    ServerAuth,
    /// Stored basic credentials did not match.
    Credentials,
    /// Remote address is not on the resource's allow list.
    IpNotAllowed,
    /// Delegated API authenticator rejected the request or is unavailable.
    ApiRejected,
    DeletionToken,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ServerAuth => "server authentication failed",
            Self::Credentials => "invalid credentials",
            Self::IpNotAllowed => "address not allowed",
            Self::ApiRejected => "api authentication failed",
            Self::DeletionToken => "invalid deletion token",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("resource not found")]
    NotFound,
    #[error("access denied: {0}")]
    AuthDenied(DenyReason),
    #[error("download quota exceeded")]
    QuotaExceeded,
    #[error("resource expired")]
    Expired,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("invalid filename")]
    InvalidFilename,
    #[error("invalid upload policy: {0}")]
    InvalidPolicy(String),
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Backend(StorageError),
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            err if err.is_not_found() => Self::NotFound,
            // A key that can never be stored can never be found either.
            StorageError::InvalidKey => Self::NotFound,
            other => Self::Backend(other),
        }
    }
}

/// Restrictions chosen by the uploader.
#[derive(Clone, Debug, Default)]
pub struct UploadPolicy {
    /// `0` means unlimited.
    pub max_downloads: u64,
    /// `0` means the resource never expires.
    pub max_days: u64,
    pub credentials: Option<Credentials>,
    /// Addresses or CIDR networks allowed to fetch the resource.
    pub allowed: Vec<String>,
    pub require_api: bool,
}

pub struct UploadRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub body: ByteStream,
    pub policy: UploadPolicy,
}

#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub token: String,
    pub filename: String,
    pub deletion_token: String,
    pub metadata: Metadata,
}

/// Who is asking. `remote` is the peer address as `ip:port`.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub remote: String,
    pub credentials: Option<Credentials>,
}

impl ClientInfo {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    fn credential_pair(&self) -> (&str, &str) {
        self.credentials
            .as_ref()
            .map(|c| (c.user.as_str(), c.password.as_str()))
            .unwrap_or(("", ""))
    }
}

pub struct Download {
    pub object: StoredObject,
    /// Record after this download was counted.
    pub metadata: Metadata,
}

#[derive(Debug)]
pub struct HeadInfo {
    pub info: ObjectInfo,
    pub metadata: Metadata,
}

#[derive(Clone)]
pub struct TransferService {
    storage: Arc<dyn Storage>,
    metadata: Arc<dyn MetadataRepository>,
    authenticator: Arc<Authenticator>,
    api_authenticator: Option<Arc<ApiAuthenticator>>,
    ip_filter: Option<Arc<IpFilter>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    locks: Arc<ResourceLocks>,
    max_upload_size: Option<u64>,
}

impl TransferService {
    pub fn new(storage: Arc<dyn Storage>, metadata: Arc<dyn MetadataRepository>) -> Self {
        Self {
            storage,
            metadata,
            authenticator: Arc::new(Authenticator::None),
            api_authenticator: None,
            ip_filter: None,
            rate_limiter: None,
            locks: Arc::new(ResourceLocks::new(DEFAULT_LOCK_SHARDS)),
            max_upload_size: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn with_api_authenticator(mut self, api: Option<ApiAuthenticator>) -> Self {
        self.api_authenticator = api.map(Arc::new);
        self
    }

    pub fn with_ip_filter(mut self, filter: Option<IpFilter>) -> Self {
        self.ip_filter = filter.map(Arc::new);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = Arc::new(ResourceLocks::new(shards));
        self
    }

    pub fn with_max_upload_size(mut self, limit: Option<u64>) -> Self {
        self.max_upload_size = limit.filter(|l| *l > 0);
        self
    }

    pub fn storage_kind(&self) -> &'static str {
        self.storage.kind()
    }

    pub fn metadata_kind(&self) -> &'static str {
        self.metadata.kind()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn max_upload_size(&self) -> Option<u64> {
        self.max_upload_size
    }

    /// Server-wide address filter. Everyone is admitted when none is set.
    pub fn admits(&self, ip: IpAddr) -> bool {
        self.ip_filter.as_ref().is_none_or(|filter| filter.allows(ip))
    }

    pub async fn upload(
        &self,
        request: UploadRequest,
        client: &ClientInfo,
    ) -> Result<UploadReceipt, TransferError> {
        self.authorize_uploader(client).await?;
        self.store_upload(&generate_token(), request).await
    }

    /// Store several files under one freshly generated token.
    ///
    /// The uploader is authenticated once and every filename and size is
    /// validated before any content is written. Each file still gets its own
    /// metadata record and deletion token. Files stored before a backend
    /// failure are kept.
    pub async fn upload_many(
        &self,
        requests: Vec<UploadRequest>,
        client: &ClientInfo,
    ) -> Result<Vec<UploadReceipt>, TransferError> {
        self.authorize_uploader(client).await?;
        if requests.is_empty() {
            return Err(TransferError::InvalidPolicy("no files in upload".into()));
        }
        for request in &requests {
            sanitize_filename(&request.filename).ok_or(TransferError::InvalidFilename)?;
            self.check_upload_size(request.content_length)?;
        }

        let token = generate_token();
        let mut receipts = Vec::with_capacity(requests.len());
        for request in requests {
            receipts.push(self.store_upload(&token, request).await?);
        }
        Ok(receipts)
    }

    async fn authorize_uploader(&self, client: &ClientInfo) -> Result<(), TransferError> {
        if !self.authenticator.is_enabled() {
            return Ok(());
        }
        let (user, password) = client.credential_pair();
        match self.authenticator.authenticate(user, password).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransferError::AuthDenied(DenyReason::ServerAuth)),
            Err(err) => {
                warn!(error = %err, authenticator = self.authenticator.name(), "upload authentication failed");
                Err(TransferError::AuthDenied(DenyReason::ServerAuth))
            }
        }
    }

    fn check_upload_size(&self, size: u64) -> Result<(), TransferError> {
        match self.max_upload_size {
            Some(limit) if size > limit => Err(TransferError::TooLarge { size, limit }),
            _ => Ok(()),
        }
    }

    async fn store_upload(
        &self,
        token: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, TransferError> {
        let filename =
            sanitize_filename(&request.filename).ok_or(TransferError::InvalidFilename)?;
        self.check_upload_size(request.content_length)?;

        let content_type = request
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let metadata = self.build_metadata(&content_type, &request.policy)?;

        self.storage
            .put(
                token,
                &filename,
                request.body,
                &content_type,
                request.content_length,
            )
            .await
            .map_err(TransferError::Backend)?;

        if let Err(err) = self.metadata.put(token, &filename, &metadata).await {
            error!(token, filename, error = %err, "content stored but metadata write failed");
            if let Err(cleanup) = self.storage.delete(token, &filename).await {
                warn!(token, filename, error = %cleanup, "could not remove orphaned content");
            }
            return Err(TransferError::Backend(err));
        }

        info!(
            token,
            filename,
            bytes = request.content_length,
            gates = ?metadata.auth_types,
            "stored upload"
        );

        Ok(UploadReceipt {
            token: token.to_string(),
            filename,
            deletion_token: metadata.deletion_token.clone(),
            metadata,
        })
    }

    fn build_metadata(
        &self,
        content_type: &str,
        policy: &UploadPolicy,
    ) -> Result<Metadata, TransferError> {
        let mut metadata = Metadata::new(content_type, generate_deletion_token());
        metadata.max_downloads = policy.max_downloads;

        if policy.max_days > 0 {
            let days = i64::try_from(policy.max_days)
                .ok()
                .and_then(Duration::try_days)
                .and_then(|span| Utc::now().checked_add_signed(span))
                .ok_or_else(|| TransferError::InvalidPolicy("max days out of range".into()))?;
            metadata.max_date = Some(days);
        }

        let entries: Vec<&str> = policy
            .allowed
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        if !entries.is_empty() {
            for entry in entries {
                let net = parse_ip_entry(entry)
                    .map_err(|err| TransferError::InvalidPolicy(err.to_string()))?;
                if net.prefix_len() == net.max_prefix_len() {
                    metadata.allowed_ips.push(net.addr());
                } else {
                    metadata.allowed_nets.push(net);
                }
            }
            metadata.auth_types.insert(AuthType::Ip);
        }

        if let Some(credentials) = &policy.credentials {
            metadata.user = credentials.user.clone();
            metadata.password = credentials.password.clone();
            metadata.auth_types.insert(AuthType::Metadata);
        }

        if policy.require_api {
            if self.api_authenticator.is_none() {
                return Err(TransferError::InvalidPolicy(
                    "api authentication is not configured on this server".into(),
                ));
            }
            metadata.auth_types.insert(AuthType::Api);
        }

        Ok(metadata)
    }

    /// Stream the content and count one download.
    pub async fn download(
        &self,
        token: &str,
        filename: &str,
        client: &ClientInfo,
    ) -> Result<Download, TransferError> {
        let metadata = self.metadata.get(token, filename).await?;
        self.check_gates(&metadata, client).await?;
        self.check_rate_limit(client)?;

        let _guard = self.locks.lock(token, filename).await;
        // Re-read under the lock; the first read only served the gates.
        let mut metadata = self.metadata.get(token, filename).await?;
        check_lifetime(&metadata)?;

        let object = self.storage.get(token, filename).await?;
        if !metadata.record_download() {
            return Err(TransferError::QuotaExceeded);
        }
        self.metadata.put(token, filename, &metadata).await?;

        debug!(token, filename, downloads = metadata.downloads, "served download");
        Ok(Download { object, metadata })
    }

    /// Resource information without touching the download counter.
    pub async fn head(
        &self,
        token: &str,
        filename: &str,
        client: &ClientInfo,
    ) -> Result<HeadInfo, TransferError> {
        let metadata = self.metadata.get(token, filename).await?;
        self.check_gates(&metadata, client).await?;
        check_lifetime(&metadata)?;

        let info = self.storage.head(token, filename).await?;
        Ok(HeadInfo { info, metadata })
    }

    /// Remove content and metadata. Deleting an already deleted resource is
    /// `NotFound`.
    pub async fn delete(
        &self,
        token: &str,
        filename: &str,
        deletion_token: &str,
    ) -> Result<(), TransferError> {
        let _guard = self.locks.lock(token, filename).await;
        let metadata = self.metadata.get(token, filename).await?;
        if !metadata.deletion_token_matches(deletion_token) {
            return Err(TransferError::AuthDenied(DenyReason::DeletionToken));
        }

        match self.storage.delete(token, filename).await {
            Ok(()) => {}
            Err(err) if self.storage.is_not_exist(&err) => {
                debug!(token, filename, "content already gone, removing metadata");
            }
            Err(err) => return Err(TransferError::Backend(err)),
        }

        match self.metadata.delete(token, filename).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(TransferError::Backend(err)),
        }

        info!(token, filename, "deleted resource");
        Ok(())
    }

    async fn check_gates(&self, metadata: &Metadata, client: &ClientInfo) -> Result<(), TransferError> {
        if !metadata.auth_required() {
            return Ok(());
        }

        if metadata.ip_filter_enabled() && !metadata.allowed_ip(&client.remote) {
            debug!(remote = %client.remote, "address not on resource allow list");
            return Err(TransferError::AuthDenied(DenyReason::IpNotAllowed));
        }

        let (user, password) = client.credential_pair();

        if metadata.credentials_required() && !metadata.authenticate(user, password) {
            return Err(TransferError::AuthDenied(DenyReason::Credentials));
        }

        if metadata.api_auth_enabled() {
            let Some(api) = &self.api_authenticator else {
                warn!("resource requires api authentication but none is configured");
                return Err(TransferError::AuthDenied(DenyReason::ApiRejected));
            };
            match api.authenticate(user, password).await {
                Ok(true) => {}
                Ok(false) => return Err(TransferError::AuthDenied(DenyReason::ApiRejected)),
                Err(err) => {
                    debug!(error = %err, "api authenticator denied request");
                    return Err(TransferError::AuthDenied(DenyReason::ApiRejected));
                }
            }
        }

        Ok(())
    }

    fn check_rate_limit(&self, client: &ClientInfo) -> Result<(), TransferError> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        // Unparseable peers share one bucket.
        let ip = parse_remote_ip(&client.remote)
            .map(|ip| ip.to_canonical())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        if limiter.check(ip) {
            Ok(())
        } else {
            debug!(%ip, "download rate limited");
            Err(TransferError::RateLimited)
        }
    }

    /// Write, read back and delete a probe object.
    pub async fn check_storage(&self) -> StorageResult<()> {
        const PROBE: &[u8] = b"readyz";
        let token = generate_token();
        let filename = "readyz-probe";

        self.storage
            .put(&token, filename, body_from_bytes(PROBE), "text/plain", PROBE.len() as u64)
            .await?;
        let object = self.storage.get(&token, filename).await?;
        let data = collect_body(object.body).await?;
        let deleted = self.storage.delete(&token, filename).await;

        if data.as_ref() != PROBE {
            return Err(StorageError::Config("probe content mismatch".into()));
        }
        deleted
    }

    /// A lookup of a random resource must come back as `NotFound`.
    pub async fn check_metadata(&self) -> StorageResult<()> {
        match self.metadata.get(&generate_token(), "readyz-probe").await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn check_lifetime(metadata: &Metadata) -> Result<(), TransferError> {
    if metadata.is_expired(Utc::now()) {
        return Err(TransferError::Expired);
    }
    if metadata.quota_reached() {
        return Err(TransferError::QuotaExceeded);
    }
    Ok(())
}
