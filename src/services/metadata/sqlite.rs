//! SQLite-backed metadata repository.
//!
//! One row per resource in the `metadata` table, keyed by (token, filename).
//! Sets and address lists are stored as JSON text columns.

use super::MetadataRepository;
use crate::{
    models::metadata::Metadata,
    services::storage::{StorageError, StorageResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

const INIT_MIGRATION: &str = include_str!("../../../migrations/0001_init.sql");

#[derive(FromRow, Debug)]
struct MetadataRow {
    content_type: String,
    downloads: i64,
    max_downloads: i64,
    max_date: Option<DateTime<Utc>>,
    deletion_token: String,
    auth_types: String,
    auth_user: String,
    auth_password: String,
    allowed_ips: String,
    allowed_nets: String,
}

impl TryFrom<MetadataRow> for Metadata {
    type Error = StorageError;

    fn try_from(row: MetadataRow) -> Result<Self, Self::Error> {
        Ok(Metadata {
            content_type: row.content_type,
            downloads: u64::try_from(row.downloads).unwrap_or_default(),
            max_downloads: u64::try_from(row.max_downloads).unwrap_or_default(),
            max_date: row.max_date,
            deletion_token: row.deletion_token,
            auth_types: serde_json::from_str(&row.auth_types)?,
            user: row.auth_user,
            password: row.auth_password,
            allowed_ips: serde_json::from_str(&row.allowed_ips)?,
            allowed_nets: serde_json::from_str(&row.allowed_nets)?,
        })
    }
}

#[derive(Clone)]
pub struct SqliteMetadataRepository {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
}

impl SqliteMetadataRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT content_type, downloads, max_downloads, max_date, deletion_token,
                    auth_types, auth_user, auth_password, allowed_ips, allowed_nets
             FROM metadata
             WHERE token = ? AND filename = ?",
        )
        .bind(token)
        .bind(filename)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::not_found(token, filename),
            other => StorageError::Sqlx(other),
        })?;

        Metadata::try_from(row)
    }

    async fn put(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (
                token, filename, content_type, downloads, max_downloads, max_date,
                deletion_token, auth_types, auth_user, auth_password,
                allowed_ips, allowed_nets, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(token, filename) DO UPDATE SET
                content_type = excluded.content_type,
                downloads = excluded.downloads,
                max_downloads = excluded.max_downloads,
                max_date = excluded.max_date,
                deletion_token = excluded.deletion_token,
                auth_types = excluded.auth_types,
                auth_user = excluded.auth_user,
                auth_password = excluded.auth_password,
                allowed_ips = excluded.allowed_ips,
                allowed_nets = excluded.allowed_nets,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(token)
        .bind(filename)
        .bind(&metadata.content_type)
        .bind(to_i64(metadata.downloads))
        .bind(to_i64(metadata.max_downloads))
        .bind(metadata.max_date)
        .bind(&metadata.deletion_token)
        .bind(serde_json::to_string(&metadata.auth_types)?)
        .bind(&metadata.user)
        .bind(&metadata.password)
        .bind(serde_json::to_string(&metadata.allowed_ips)?)
        .bind(serde_json::to_string(&metadata.allowed_nets)?)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM metadata WHERE token = ? AND filename = ?")
            .bind(token)
            .bind(filename)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(token, filename));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}
