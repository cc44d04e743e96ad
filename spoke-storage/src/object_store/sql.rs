//! Relational blob store.
//!
//! Backs the plain `postgres` driver, where schemas are small enough that
//! offloading bytes to an object store is not worth the moving part.
//! Content rows are keyed by hash with insert-or-ignore semantics, so the
//! dedup contract matches the S3 adapter exactly.

use super::{read_all_hashed, validate_content_hash, validate_language, BlobStore};
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::types::{validate_module_name, validate_version_tag};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use tokio::io::AsyncRead;

pub struct SqlBlobStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl SqlBlobStore {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    async fn bound<T>(
        &self,
        ctx: &OpContext,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StorageError> {
        let budget = ctx.query_deadline(self.query_timeout);
        ctx.bound_within(budget, fut)
            .await?
            .map_err(StorageError::from)
    }
}

#[async_trait]
impl BlobStore for SqlBlobStore {
    async fn put_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<String, StorageError> {
        let (payload, hash) = read_all_hashed(ctx, reader).await?;
        self.bound(
            ctx,
            sqlx::query(
                "INSERT INTO contents (hash, media_type, bytes, created_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (hash) DO NOTHING",
            )
            .bind(&hash)
            .bind(content_type)
            .bind(payload.as_ref())
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;
        Ok(hash)
    }

    async fn get_content(&self, ctx: &OpContext, hash: &str) -> Result<Bytes, StorageError> {
        validate_content_hash(hash)?;
        let row: Option<(Vec<u8>,)> = self
            .bound(
                ctx,
                sqlx::query_as("SELECT bytes FROM contents WHERE hash = $1")
                    .bind(hash)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(|(bytes,)| Bytes::from(bytes))
            .ok_or_else(|| StorageError::NotFound(format!("content {}", hash)))
    }

    async fn content_exists(&self, ctx: &OpContext, hash: &str) -> Result<bool, StorageError> {
        validate_content_hash(hash)?;
        let row: Option<(i32,)> = self
            .bound(
                ctx,
                sqlx::query_as("SELECT 1 FROM contents WHERE hash = $1")
                    .bind(hash)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn put_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
        payload: Bytes,
    ) -> Result<(), StorageError> {
        validate_module_name(module)?;
        validate_version_tag(version)?;
        validate_language(language)?;
        self.bound(
            ctx,
            sqlx::query(
                "INSERT INTO artifacts (module_name, version, language, bytes, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (module_name, version, language) \
                 DO UPDATE SET bytes = EXCLUDED.bytes, updated_at = EXCLUDED.updated_at",
            )
            .bind(module)
            .bind(version)
            .bind(language)
            .bind(payload.as_ref())
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn get_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
    ) -> Result<Bytes, StorageError> {
        validate_module_name(module)?;
        validate_version_tag(version)?;
        validate_language(language)?;
        let row: Option<(Vec<u8>,)> = self
            .bound(
                ctx,
                sqlx::query_as(
                    "SELECT bytes FROM artifacts \
                     WHERE module_name = $1 AND version = $2 AND language = $3",
                )
                .bind(module)
                .bind(version)
                .bind(language)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(|(bytes,)| Bytes::from(bytes)).ok_or_else(|| {
            StorageError::NotFound(format!("artifact {}/{}/{}", module, version, language))
        })
    }

    async fn health_check(&self, ctx: &OpContext) -> Result<(), StorageError> {
        let _: (i32,) = self
            .bound(
                ctx,
                sqlx::query_as("SELECT 1").fetch_one(&self.pool),
            )
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sql"
    }
}

impl std::fmt::Debug for SqlBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBlobStore").finish_non_exhaustive()
    }
}
