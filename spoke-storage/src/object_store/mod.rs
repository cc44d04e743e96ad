//! Content-addressed blob storage.
//!
//! Blobs are keyed by the hex digest of their bytes, so identical content
//! deduplicates to one stored object and retried puts are safe. Compiled
//! artifacts are opaque byte streams under `(module, version, language)`
//! keys and replace atomically. Two implementations: an S3-compatible
//! object store (hybrid driver) and a relational table (postgres driver).

pub mod s3;
pub mod sql;

pub use s3::S3BlobStore;
pub use sql::SqlBlobStore;

use crate::context::OpContext;
use crate::errors::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Object-key prefix for content blobs.
pub const CONTENT_PREFIX: &str = "blobs";
/// Object-key prefix for compiled artifacts.
pub const ARTIFACT_PREFIX: &str = "artifacts";

const READ_CHUNK: usize = 64 * 1024;

/// Content-addressed PUT/GET of opaque byte streams plus the artifact
/// variants. All operations honor the context and perform their own
/// bounded retries on transient transport failures.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream the payload while computing its digest, store it under the
    /// derived key and return the hash. Idempotent: an existing object
    /// under the same key skips the upload.
    async fn put_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn get_content(&self, ctx: &OpContext, hash: &str) -> Result<Bytes, StorageError>;

    async fn content_exists(&self, ctx: &OpContext, hash: &str) -> Result<bool, StorageError>;

    /// Atomically replace the artifact under `(module, version, language)`.
    async fn put_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
        payload: Bytes,
    ) -> Result<(), StorageError>;

    async fn get_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
    ) -> Result<Bytes, StorageError>;

    async fn health_check(&self, ctx: &OpContext) -> Result<(), StorageError>;

    /// Release the underlying client at teardown; subsequent calls fail
    /// with `Unavailable`. A no-op for stores whose connections are
    /// owned elsewhere (the relational blob store rides the metadata
    /// pool, which the backend closes itself).
    async fn close(&self) {}

    fn backend_name(&self) -> &'static str;
}

/// Hex digest of a byte slice. The single place the hash algorithm is
/// chosen; everything else works with the hex string.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hashes are lowercase hex digests. They end up in object keys and
/// filesystem paths, so anything else is rejected outright.
pub fn validate_content_hash(hash: &str) -> Result<(), StorageError> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(StorageError::InvalidArgument(format!(
            "malformed content hash: {}",
            hash
        )));
    }
    Ok(())
}

/// Target languages key artifact objects and paths; keep them to a tight
/// identifier grammar.
pub fn validate_language(language: &str) -> Result<(), StorageError> {
    if language.is_empty()
        || language.len() > 64
        || !language
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(StorageError::InvalidArgument(format!(
            "malformed artifact language: {}",
            language
        )));
    }
    Ok(())
}

/// `blobs/<hh>/<hh>/<remaining hex>`, sharded for directory fan-out.
pub fn content_key(hash: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        CONTENT_PREFIX,
        &hash[0..2],
        &hash[2..4],
        &hash[4..]
    )
}

/// `artifacts/<module>/<version>/<language>`.
pub fn artifact_key(module: &str, version: &str, language: &str) -> String {
    format!("{}/{}/{}/{}", ARTIFACT_PREFIX, module, version, language)
}

/// Drain a reader into memory while feeding the digest, re-checking the
/// context at every chunk boundary.
pub(crate) async fn read_all_hashed(
    ctx: &OpContext,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<(Bytes, String), StorageError> {
    let mut hasher = Sha256::new();
    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        ctx.check()?;
        let n = ctx.bound(reader.read(&mut chunk)).await??;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        buffer.extend_from_slice(&chunk[..n]);
    }
    let hash = hex::encode(hasher.finalize());
    Ok((Bytes::from(buffer), hash))
}

/// Bounded exponential backoff with jitter for transient failures.
/// Logical errors and context errors pass through on the first hit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, ctx: &OpContext, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            ctx.check()?;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient blob store failure");
                    ctx.bound(tokio::time::sleep(delay)).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        // Up to 50% jitter to avoid retry alignment across tasks.
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_content_hash_is_deterministic_and_distinct() {
        let a = content_hash(b"syntax=\"proto3\";");
        let b = content_hash(b"syntax=\"proto3\";");
        let c = content_hash(b"something else");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(validate_content_hash(&a).is_ok());
    }

    #[test]
    fn test_content_key_sharding() {
        let hash = content_hash(b"x");
        let key = content_key(&hash);
        assert!(key.starts_with("blobs/"));
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
        assert_eq!(format!("{}{}{}", parts[1], parts[2], parts[3]), hash);
    }

    #[test]
    fn test_hash_validation_rejects_path_material() {
        assert!(validate_content_hash("../../etc/passwd").is_err());
        assert!(validate_content_hash("abcd").is_err());
        assert!(validate_content_hash(&"Z".repeat(64)).is_err());
        assert!(validate_content_hash(&"A".repeat(64)).is_err());
    }

    #[test]
    fn test_language_validation() {
        assert!(validate_language("go").is_ok());
        assert!(validate_language("python3").is_ok());
        assert!(validate_language("c_sharp").is_ok());
        assert!(validate_language("").is_err());
        assert!(validate_language("go/1.21").is_err());
    }

    #[test]
    fn test_artifact_key_layout() {
        assert_eq!(
            artifact_key("acme", "v1.0.0", "go"),
            "artifacts/acme/v1.0.0/go"
        );
    }

    #[tokio::test]
    async fn test_read_all_hashed_matches_direct_hash() {
        let payload = b"streaming payload".to_vec();
        let mut reader = std::io::Cursor::new(payload.clone());
        let ctx = OpContext::background();
        let (bytes, hash) = read_all_hashed(&ctx, &mut reader).await.unwrap();
        assert_eq!(bytes.as_ref(), payload.as_slice());
        assert_eq!(hash, content_hash(&payload));
    }

    #[tokio::test]
    async fn test_retry_stops_on_logical_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let ctx = OpContext::background();
        let result: Result<(), _> = policy
            .run(&ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::NotFound("blob".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_transient_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let ctx = OpContext::background();
        let result: Result<(), _> = policy
            .run(&ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::Unavailable("flaky".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let ctx = OpContext::background();
        let result = policy
            .run(&ctx, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(StorageError::Unavailable("first try".to_string()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
