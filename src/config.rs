use crate::services::{
    auth::{ApiAuthenticator, ApiConfig, Authenticator, StaticCredentials},
    ip_filter::{IpFilter, IpFilterOptions},
    locks::DEFAULT_LOCK_SHARDS,
    storage::{
        StorageOptions,
        operator::{GdriveOptions, S3Options},
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr};

const ENV_PREFIX: &str = "TRANSFER_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub provider: String,
    /// `sqlite` or the name of a content provider.
    pub meta_provider: String,
    pub basedir: String,
    pub database_url: String,
    pub s3: S3Options,
    pub gdrive: GdriveOptions,
    pub redis_url: Option<String>,
    pub http_auth_user: Option<String>,
    pub http_auth_pass: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_headers: BTreeMap<String, String>,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    /// Downloads per minute per address, `0` disables the limit.
    pub rate_limit: u32,
    pub cors_domains: Vec<String>,
    pub max_upload_size: Option<u64>,
    pub lock_shards: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file sharing service")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Content backend: local, s3, gdrive, redis or memory (overrides TRANSFER_PROVIDER)
    #[arg(long)]
    pub provider: Option<String>,

    /// Metadata backend: sqlite or a content provider name (overrides TRANSFER_META_PROVIDER)
    #[arg(long)]
    pub meta_provider: Option<String>,

    /// Directory for the local provider (overrides TRANSFER_BASEDIR)
    #[arg(long)]
    pub basedir: Option<String>,

    /// SQLite URL for the sqlite metadata provider (overrides TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    #[arg(long)]
    pub s3_endpoint: Option<String>,

    #[arg(long)]
    pub s3_region: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    #[arg(long)]
    pub aws_access_key: Option<String>,

    #[arg(long)]
    pub aws_secret_key: Option<String>,

    /// Address buckets as `{bucket}.{endpoint}`
    #[arg(long)]
    pub s3_virtual_host_style: bool,

    #[arg(long)]
    pub gdrive_root: Option<String>,

    #[arg(long)]
    pub gdrive_access_token: Option<String>,

    #[arg(long)]
    pub gdrive_refresh_token: Option<String>,

    #[arg(long)]
    pub gdrive_client_id: Option<String>,

    #[arg(long)]
    pub gdrive_client_secret: Option<String>,

    /// redis://[:password@]host:port[/db]
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Upload user for HTTP basic auth
    #[arg(long)]
    pub http_auth_user: Option<String>,

    /// Upload password for HTTP basic auth
    #[arg(long)]
    pub http_auth_pass: Option<String>,

    /// Endpoint of the delegated authentication API
    #[arg(long)]
    pub api_endpoint: Option<String>,

    /// Headers sent to the API endpoint as `Name=value,Other=value`
    #[arg(long)]
    pub api_headers: Option<String>,

    /// Comma separated addresses or networks allowed to connect
    #[arg(long)]
    pub ip_whitelist: Option<String>,

    /// Comma separated addresses or networks refused
    #[arg(long)]
    pub ip_blacklist: Option<String>,

    /// Downloads per minute per address (0 disables)
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Comma separated origins allowed by CORS
    #[arg(long)]
    pub cors_domains: Option<String>,

    /// Largest accepted upload in bytes (0 for no limit)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    #[arg(long)]
    pub lock_shards: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Reads `TRANSFER_*` variables. Swappable for tests.
trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;

    fn string(&self, key: &str) -> Option<String> {
        self.var(&format!("{ENV_PREFIX}{key}"))
            .filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.string(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("parsing {ENV_PREFIX}{key} value `{value}`")),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.string(key)
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
    }
}

struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, &ProcessEnv)?, migrate))
    }

    fn merge(args: Args, env: &impl EnvSource) -> Result<Self> {
        let provider = args
            .provider
            .or_else(|| env.string("PROVIDER"))
            .unwrap_or_else(|| "local".into());
        let meta_provider = args
            .meta_provider
            .or_else(|| env.string("META_PROVIDER"))
            .unwrap_or_else(|| provider.clone());

        let api_headers = match args.api_headers.or_else(|| env.string("API_HEADERS")) {
            Some(raw) => ApiConfig::parse_headers(&raw).context("parsing api headers")?,
            None => BTreeMap::new(),
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| env.string("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => env.parsed("PORT")?.unwrap_or(8080),
            },
            provider,
            meta_provider,
            basedir: args
                .basedir
                .or_else(|| env.string("BASEDIR"))
                .unwrap_or_else(|| "./data/files".into()),
            database_url: args
                .database_url
                .or_else(|| env.string("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/transfer.db".into()),
            s3: S3Options {
                bucket: args.bucket.or_else(|| env.string("BUCKET")),
                region: args.s3_region.or_else(|| env.string("S3_REGION")),
                endpoint: args.s3_endpoint.or_else(|| env.string("S3_ENDPOINT")),
                access_key: args.aws_access_key.or_else(|| env.string("AWS_ACCESS_KEY")),
                secret_key: args.aws_secret_key.or_else(|| env.string("AWS_SECRET_KEY")),
                virtual_host_style: args.s3_virtual_host_style
                    || env.flag("S3_VIRTUAL_HOST_STYLE"),
            },
            gdrive: GdriveOptions {
                root: args.gdrive_root.or_else(|| env.string("GDRIVE_ROOT")),
                access_token: args
                    .gdrive_access_token
                    .or_else(|| env.string("GDRIVE_ACCESS_TOKEN")),
                refresh_token: args
                    .gdrive_refresh_token
                    .or_else(|| env.string("GDRIVE_REFRESH_TOKEN")),
                client_id: args
                    .gdrive_client_id
                    .or_else(|| env.string("GDRIVE_CLIENT_ID")),
                client_secret: args
                    .gdrive_client_secret
                    .or_else(|| env.string("GDRIVE_CLIENT_SECRET")),
            },
            redis_url: args.redis_url.or_else(|| env.string("REDIS_URL")),
            http_auth_user: args.http_auth_user.or_else(|| env.string("HTTP_AUTH_USER")),
            http_auth_pass: args.http_auth_pass.or_else(|| env.string("HTTP_AUTH_PASS")),
            api_endpoint: args.api_endpoint.or_else(|| env.string("API_ENDPOINT")),
            api_headers,
            ip_whitelist: split_list(args.ip_whitelist.or_else(|| env.string("IP_WHITELIST"))),
            ip_blacklist: split_list(args.ip_blacklist.or_else(|| env.string("IP_BLACKLIST"))),
            rate_limit: match args.rate_limit {
                Some(limit) => limit,
                None => env.parsed("RATE_LIMIT")?.unwrap_or(0),
            },
            cors_domains: split_list(args.cors_domains.or_else(|| env.string("CORS_DOMAINS"))),
            max_upload_size: match args.max_upload_size {
                Some(size) => Some(size),
                None => env.parsed("MAX_UPLOAD_SIZE")?,
            }
            .filter(|size| *size > 0),
            lock_shards: match args.lock_shards {
                Some(shards) => shards,
                None => env.parsed("LOCK_SHARDS")?.unwrap_or(DEFAULT_LOCK_SHARDS),
            },
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            basedir: Some(PathBuf::from(&self.basedir)),
            s3: self.s3.clone(),
            gdrive: self.gdrive.clone(),
            redis_url: self.redis_url.clone(),
        }
    }

    pub fn uses_sqlite_metadata(&self) -> bool {
        self.meta_provider == "sqlite"
    }

    /// Delegated API authenticator, when an endpoint is configured.
    pub fn api_authenticator(&self) -> Result<Option<ApiAuthenticator>> {
        let Some(endpoint) = &self.api_endpoint else {
            return Ok(None);
        };
        let config = ApiConfig {
            endpoint: endpoint.clone(),
            headers: self.api_headers.clone(),
        };
        Ok(Some(
            ApiAuthenticator::new(config).context("building api authenticator")?,
        ))
    }

    /// Upload gate: basic credentials first, then the API, otherwise open.
    pub fn upload_authenticator(&self) -> Result<Authenticator> {
        if let (Some(user), Some(pass)) = (&self.http_auth_user, &self.http_auth_pass) {
            return Ok(Authenticator::Static(StaticCredentials::new(user, pass)));
        }
        Ok(match self.api_authenticator()? {
            Some(api) => Authenticator::Api(api),
            None => Authenticator::None,
        })
    }

    /// A non-empty whitelist blocks everyone else.
    pub fn ip_filter(&self) -> Result<Option<IpFilter>> {
        if self.ip_whitelist.is_empty() && self.ip_blacklist.is_empty() {
            return Ok(None);
        }
        let options = IpFilterOptions {
            allowed: self.ip_whitelist.clone(),
            blocked: self.ip_blacklist.clone(),
            block_by_default: !self.ip_whitelist.is_empty(),
        };
        Ok(Some(IpFilter::new(&options).context("parsing ip filter lists")?))
    }
}
