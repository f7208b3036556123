//! Remote object backends driven through OpenDAL.
//!
//! One adapter covers the object store (`s3`) and cloud drive (`gdrive`)
//! providers. Objects live at `{token}/{filename}`. Services that cannot
//! carry a content type natively get a `{token}/.{filename}.type` sidecar,
//! written after the content; a missing sidecar reads as
//! `application/octet-stream`.

use super::{
    ByteStream, DEFAULT_CONTENT_TYPE, ObjectInfo, Storage, StorageError, StorageResult,
    StoredObject, collect_declared, ensure_resource_key_safe,
};
use async_trait::async_trait;
use opendal::{ErrorKind, Operator, layers::TracingLayer, services};
use tracing::debug;

/// Object store settings.
#[derive(Clone, Debug, Default)]
pub struct S3Options {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub virtual_host_style: bool,
}

/// Cloud drive settings.
#[derive(Clone, Debug, Default)]
pub struct GdriveOptions {
    pub root: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OperatorStorage {
    op: Operator,
    kind: &'static str,
    native_content_type: bool,
}

impl OperatorStorage {
    fn from_operator(op: Operator, kind: &'static str) -> Self {
        let native_content_type = op.info().full_capability().write_with_content_type;
        Self {
            op,
            kind,
            native_content_type,
        }
    }

    /// S3 or any S3-compatible object store.
    pub fn s3(opts: &S3Options) -> StorageResult<Self> {
        let bucket = opts
            .bucket
            .as_deref()
            .ok_or_else(|| StorageError::Config("bucket not set".into()))?;
        let access_key = opts
            .access_key
            .as_deref()
            .ok_or_else(|| StorageError::Config("access key not set".into()))?;
        let secret_key = opts
            .secret_key
            .as_deref()
            .ok_or_else(|| StorageError::Config("secret key not set".into()))?;

        let mut builder = services::S3::default()
            .root("/")
            .bucket(bucket)
            .region(opts.region.as_deref().unwrap_or("eu-west-1"))
            .access_key_id(access_key)
            .secret_access_key(secret_key);
        if let Some(endpoint) = opts.endpoint.as_deref() {
            builder = builder.endpoint(endpoint);
        }
        if opts.virtual_host_style {
            builder = builder.enable_virtual_host_style();
        }

        let op = Operator::new(builder)?.layer(TracingLayer).finish();
        Ok(Self::from_operator(op, "s3"))
    }

    /// Google Drive, rooted at `root`.
    pub fn gdrive(opts: &GdriveOptions) -> StorageResult<Self> {
        let root = opts
            .root
            .as_deref()
            .ok_or_else(|| StorageError::Config("gdrive root not set".into()))?;

        let mut builder = services::Gdrive::default().root(root);
        match (&opts.access_token, &opts.refresh_token) {
            (Some(token), _) => builder = builder.access_token(token),
            (None, Some(refresh)) => {
                let client_id = opts
                    .client_id
                    .as_deref()
                    .ok_or_else(|| StorageError::Config("gdrive client id not set".into()))?;
                let client_secret = opts
                    .client_secret
                    .as_deref()
                    .ok_or_else(|| StorageError::Config("gdrive client secret not set".into()))?;
                builder = builder
                    .refresh_token(refresh)
                    .client_id(client_id)
                    .client_secret(client_secret);
            }
            (None, None) => {
                return Err(StorageError::Config(
                    "gdrive access token or refresh token required".into(),
                ));
            }
        }

        let op = Operator::new(builder)?.layer(TracingLayer).finish();
        Ok(Self::from_operator(op, "gdrive"))
    }

    /// OpenDAL's in-memory service. Used to exercise this adapter in tests.
    pub fn memory() -> StorageResult<Self> {
        let op = Operator::new(services::Memory::default())?.finish();
        Ok(Self::from_operator(op, "opendal-memory"))
    }

    fn content_path(token: &str, filename: &str) -> String {
        format!("{token}/{filename}")
    }

    fn type_path(token: &str, filename: &str) -> String {
        format!("{token}/.{filename}.type")
    }

    fn map_err(err: opendal::Error, token: &str, filename: &str) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::not_found(token, filename)
        } else {
            StorageError::OpenDal(err)
        }
    }

    async fn sidecar_content_type(&self, token: &str, filename: &str) -> StorageResult<String> {
        match self.op.read(&Self::type_path(token, filename)).await {
            Ok(buf) => {
                let value = String::from_utf8_lossy(&buf.to_bytes()).trim().to_string();
                if value.is_empty() {
                    Ok(DEFAULT_CONTENT_TYPE.to_string())
                } else {
                    Ok(value)
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DEFAULT_CONTENT_TYPE.to_string()),
            Err(err) => Err(StorageError::OpenDal(err)),
        }
    }

    async fn stat(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo> {
        let meta = self
            .op
            .stat(&Self::content_path(token, filename))
            .await
            .map_err(|err| Self::map_err(err, token, filename))?;

        let content_type = if self.native_content_type {
            meta.content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string()
        } else {
            self.sidecar_content_type(token, filename).await?
        };

        Ok(ObjectInfo {
            content_length: meta.content_length(),
            content_type,
        })
    }
}

#[async_trait]
impl Storage for OperatorStorage {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<StoredObject> {
        ensure_resource_key_safe(token, filename)?;
        let data = self
            .op
            .read(&Self::content_path(token, filename))
            .await
            .map_err(|err| Self::map_err(err, token, filename))?
            .to_bytes();

        let content_type = if self.native_content_type {
            self.stat(token, filename).await?.content_type
        } else {
            self.sidecar_content_type(token, filename).await?
        };

        Ok(StoredObject::from_bytes(data, content_type))
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo> {
        ensure_resource_key_safe(token, filename)?;
        self.stat(token, filename).await
    }

    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: ByteStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        let data = collect_declared(body, content_length).await?;
        let path = Self::content_path(token, filename);

        if self.native_content_type {
            self.op
                .write_with(&path, data)
                .content_type(content_type)
                .await?;
        } else {
            self.op.write(&path, data).await?;
            self.op
                .write(&Self::type_path(token, filename), content_type.to_string())
                .await?;
        }

        debug!(backend = self.kind, token, filename, bytes = content_length, "stored object");
        Ok(())
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        self.op.delete(&Self::content_path(token, filename)).await?;
        if !self.native_content_type {
            self.op.delete(&Self::type_path(token, filename)).await?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        self.kind
    }
}
