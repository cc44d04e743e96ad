//! S3-compatible object store adapter.
//!
//! Backs the hybrid driver. Works against AWS and against any
//! S3-compatible server (a custom endpoint plus path-style addressing).
//! Transient transport failures are retried with bounded backoff; missing
//! keys surface as `NotFound` immediately.

use super::{
    artifact_key, content_key, read_all_hashed, validate_content_hash, validate_language,
    BlobStore, RetryPolicy,
};
use crate::config::ObjectStoreConfig;
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::types::{validate_module_name, validate_version_tag};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::sync::RwLock;
use tokio::io::AsyncRead;
use tracing::debug;

pub struct S3BlobStore {
    // Taken at teardown so in-flight handles drain and late callers fail
    // cleanly instead of dialing a half-shut-down endpoint.
    client: RwLock<Option<aws_sdk_s3::Client>>,
    bucket: String,
    retry: RetryPolicy,
}

impl S3BlobStore {
    /// Build the client from static credentials and an optional custom
    /// endpoint. Connectivity is only exercised by the first request (or
    /// the health probe); bootstrap stays local.
    pub async fn connect(config: &ObjectStoreConfig) -> Result<Self, StorageError> {
        let credentials = aws_credential_types::Credentials::from_keys(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
        );
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style())
            .build();
        Ok(Self {
            client: RwLock::new(Some(aws_sdk_s3::Client::from_conf(s3_config))),
            bucket: config.bucket.clone(),
            retry: RetryPolicy::default(),
        })
    }

    /// Cheap handle clone (the client is reference counted). Fails once
    /// the store has been closed.
    fn client(&self) -> Result<aws_sdk_s3::Client, StorageError> {
        self.client
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| StorageError::Unavailable("object store client closed".to_string()))
    }

    async fn object_exists(&self, ctx: &OpContext, key: &str) -> Result<bool, StorageError> {
        let client = self.client()?;
        let outcome = ctx
            .bound(client.head_object().bucket(&self.bucket).key(key).send())
            .await?;
        match outcome {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(false),
            Err(e) => Err(map_sdk_error("head_object", e)),
        }
    }

    async fn put_object(
        &self,
        ctx: &OpContext,
        key: &str,
        content_type: Option<&str>,
        payload: Bytes,
    ) -> Result<(), StorageError> {
        let client = self.client()?;
        self.retry
            .run(ctx, || {
                let payload = payload.clone();
                let client = client.clone();
                async move {
                    let mut request = client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .body(ByteStream::from(payload));
                    if let Some(content_type) = content_type {
                        request = request.content_type(content_type);
                    }
                    ctx.bound(request.send())
                        .await?
                        .map(|_| ())
                        .map_err(|e| map_sdk_error("put_object", e))
                }
            })
            .await
    }

    async fn get_object(&self, ctx: &OpContext, key: &str) -> Result<Bytes, StorageError> {
        let client = self.client()?;
        let output = self
            .retry
            .run(ctx, || {
                let client = client.clone();
                async move {
                    let outcome = ctx
                        .bound(client.get_object().bucket(&self.bucket).key(key).send())
                        .await?;
                    match outcome {
                        Ok(output) => Ok(output),
                        Err(SdkError::ServiceError(service)) if service.err().is_no_such_key() => {
                            Err(StorageError::NotFound(format!("object {}", key)))
                        }
                        Err(e) => Err(map_sdk_error("get_object", e)),
                    }
                }
            })
            .await?;

        let collected = ctx
            .bound(output.body.collect())
            .await?
            .map_err(|e| StorageError::Unavailable(format!("object body read: {}", e)))?;
        Ok(collected.into_bytes())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<String, StorageError> {
        let (payload, hash) = read_all_hashed(ctx, reader).await?;
        let key = content_key(&hash);

        // Content addressing makes the PUT idempotent: the key exists
        // exactly when the bytes are already stored.
        if self.object_exists(ctx, &key).await? {
            debug!(%hash, "content blob already present, skipping upload");
            return Ok(hash);
        }
        self.put_object(ctx, &key, Some(content_type), payload)
            .await?;
        Ok(hash)
    }

    async fn get_content(&self, ctx: &OpContext, hash: &str) -> Result<Bytes, StorageError> {
        validate_content_hash(hash)?;
        self.get_object(ctx, &content_key(hash)).await
    }

    async fn content_exists(&self, ctx: &OpContext, hash: &str) -> Result<bool, StorageError> {
        validate_content_hash(hash)?;
        self.object_exists(ctx, &content_key(hash)).await
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
        self.put_object(ctx, &artifact_key(module, version, language), None, payload)
            .await
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
        self.get_object(ctx, &artifact_key(module, version, language))
            .await
    }

    async fn health_check(&self, ctx: &OpContext) -> Result<(), StorageError> {
        let client = self.client()?;
        let outcome = ctx
            .bound(client.head_bucket().bucket(&self.bucket).send())
            .await?;
        outcome
            .map(|_| ())
            .map_err(|e| map_sdk_error("head_bucket", e))
    }

    async fn close(&self) {
        // Dropping the last handle releases the client's connection pool.
        self.client.write().unwrap().take();
        debug!(bucket = %self.bucket, "object store client closed");
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Transport-level failures are retryable `Unavailable`; everything the
/// service itself rejected surfaces as `Internal` unless mapped earlier.
fn map_sdk_error<E>(operation: &'static str, err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(format!("{}: {}", operation, DisplayErrorContext(&err)))
        }
        _ => StorageError::Internal(format!("{}: {}", operation, DisplayErrorContext(&err))),
    }
}
