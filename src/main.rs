use anyhow::{Context, Result};
use ephemeral_transfer::{
    config::AppConfig,
    routes,
    services::{
        metadata::{MetadataRepository, SqliteMetadataRepository, StorageMetadataRepository},
        rate_limiter::RateLimiter,
        storage::{Storage, build_storage},
        transfer_service::TransferService,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        provider = %cfg.provider,
        meta_provider = %cfg.meta_provider,
        rate_limit = cfg.rate_limit,
        "starting transfer service"
    );

    // --- Handle migration mode ---
    if migrate {
        let repo = open_sqlite(&cfg.database_url).await?;
        repo.migrate().await.context("running migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize backends ---
    let storage_options = cfg.storage_options();
    let storage = build_storage(&cfg.provider, &storage_options)
        .await
        .with_context(|| format!("building `{}` storage", cfg.provider))?;

    let metadata: Arc<dyn MetadataRepository> = if cfg.uses_sqlite_metadata() {
        let repo = open_sqlite(&cfg.database_url).await?;
        repo.migrate().await.context("applying metadata schema")?;
        Arc::new(repo)
    } else {
        let meta_storage: Arc<dyn Storage> = if cfg.meta_provider == cfg.provider {
            storage.clone()
        } else {
            build_storage(&cfg.meta_provider, &storage_options)
                .await
                .with_context(|| format!("building `{}` metadata storage", cfg.meta_provider))?
        };
        Arc::new(StorageMetadataRepository::new(meta_storage))
    };

    let rate_limiter = (cfg.rate_limit > 0).then(|| Arc::new(RateLimiter::per_minute(cfg.rate_limit)));
    if let Some(limiter) = &rate_limiter {
        RateLimiter::spawn_pruner(limiter.clone());
    }

    // --- Initialize core service ---
    let authenticator = cfg.upload_authenticator()?;
    tracing::info!(authenticator = authenticator.name(), "upload authentication");

    let service = TransferService::new(storage, metadata)
        .with_authenticator(authenticator)
        .with_api_authenticator(cfg.api_authenticator()?)
        .with_ip_filter(cfg.ip_filter()?)
        .with_rate_limiter(rate_limiter)
        .with_lock_shards(cfg.lock_shards)
        .with_max_upload_size(cfg.max_upload_size);

    // --- Build router ---
    let app = routes::routes::routes(service, &cfg.cors_domains);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Open the SQLite pool, creating the database file and its directory first.
async fn open_sqlite(db_url: &str) -> Result<SqliteMetadataRepository> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    let db_path_obj = Path::new(db_path);

    // Create parent directory if needed
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create a missing file on its own
    if !db_path_obj.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(db_path)
            .with_context(|| format!("creating database file {db_path}"))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {db_url}"))?;

    Ok(SqliteMetadataRepository::new(Arc::new(pool)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
