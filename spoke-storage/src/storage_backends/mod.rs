//! Backend drivers and the bootstrap factory.
//!
//! A driver realizes the full storage contract against one physical
//! substrate. `build_storage` validates the configuration and constructs
//! the driver selected by `backend`: the filesystem driver, the plain
//! relational driver (blobs in the database) or the hybrid driver
//! (relational metadata plus an S3-compatible object store, fronted by
//! the cache tier).

pub mod filesystem;
pub mod sql_backend;

pub use filesystem::FilesystemBackend;
pub use sql_backend::SqlBackend;

use crate::cache::{L2Cache, TieredCache};
use crate::config::{BackendType, StorageConfig};
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::metadata::MetadataStore;
use crate::object_store::{BlobStore, S3BlobStore, SqlBlobStore};
use crate::observability::{outcome_label, StorageMetrics};
use crate::storage::Storage;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Construct the backend selected by the configuration. The config must
/// already be validated; corrupt configuration aborts bootstrap.
pub async fn build_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    config
        .validate()
        .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
    let metrics = Arc::new(StorageMetrics::new());

    match config.backend {
        BackendType::Filesystem => {
            let root = config
                .filesystem
                .root
                .as_ref()
                .ok_or_else(|| StorageError::InvalidArgument("missing filesystem root".into()))?;
            info!(root = %root.display(), "starting filesystem storage backend");
            Ok(Arc::new(FilesystemBackend::open(root.clone(), metrics)?))
        }
        BackendType::Postgres => {
            let meta = Arc::new(MetadataStore::connect(&config.metadata)?);
            let blobs: Arc<dyn BlobStore> = Arc::new(SqlBlobStore::new(
                meta.primary_pool(),
                meta.query_timeout(),
            ));
            let cache = build_cache(config, Arc::clone(&metrics)).await;
            info!("starting relational storage backend");
            Ok(Arc::new(SqlBackend::new(
                meta, blobs, cache, metrics, "postgres", false,
            )))
        }
        BackendType::Hybrid => {
            let meta = Arc::new(MetadataStore::connect(&config.metadata)?);
            let blobs: Arc<dyn BlobStore> =
                Arc::new(S3BlobStore::connect(&config.object_store).await?);
            let cache = build_cache(config, Arc::clone(&metrics)).await;
            info!(bucket = %config.object_store.bucket, "starting hybrid storage backend");
            Ok(Arc::new(SqlBackend::new(
                meta, blobs, cache, metrics, "hybrid", true,
            )))
        }
    }
}

/// The cache tier comes up even when the network cache is unreachable:
/// an L2 outage must never take the registry down with it.
async fn build_cache(
    config: &StorageConfig,
    metrics: Arc<StorageMetrics>,
) -> Option<Arc<TieredCache>> {
    if !config.cache.enabled {
        return None;
    }
    let l2 = if config.network_cache.url.is_some() {
        match L2Cache::connect(&config.network_cache).await {
            Ok(l2) => Some(l2),
            Err(e) => {
                warn!(error = %e, "network cache unavailable at bootstrap, running with L1 only");
                None
            }
        }
    } else {
        None
    };
    Some(Arc::new(TieredCache::new(
        config.cache.clone(),
        l2,
        metrics,
    )))
}

/// Tracks one in-flight operation for drain-on-close accounting.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait until every in-flight operation finished or the grace period
/// elapsed. Returns whether the drain completed.
pub(crate) async fn drain_in_flight(counter: &AtomicUsize, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while counter.load(Ordering::SeqCst) > 0 {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Shared per-operation machinery for the drivers: rejects work after
/// shutdown, tracks in-flight counts, bounds the operation by the
/// context, records metrics and emits the structured log record.
pub(crate) struct OpRunner {
    backend: &'static str,
    metrics: Arc<StorageMetrics>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl OpRunner {
    pub(crate) fn new(backend: &'static str, metrics: Arc<StorageMetrics>) -> Self {
        Self {
            backend,
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) async fn run<T, F>(
        &self,
        ctx: &OpContext,
        op: &'static str,
        fut: F,
    ) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(StorageError::Canceled);
        }
        let _guard = InFlightGuard::enter(&self.in_flight);
        let started = Instant::now();
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(StorageError::Canceled),
            bounded = ctx.bound(fut) => match bounded {
                Ok(inner) => inner,
                Err(e) => Err(e),
            },
        };
        self.metrics
            .record_op(op, self.backend, outcome_label(&result), started.elapsed());
        match &result {
            Ok(_) => debug!(
                operation = op,
                backend = self.backend,
                request_id = ?ctx.request_id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "storage operation ok"
            ),
            Err(e) => debug!(
                operation = op,
                backend = self.backend,
                request_id = ?ctx.request_id(),
                error = %e,
                "storage operation failed"
            ),
        }
        result
    }

    /// Drain then cut off stragglers. Returns whether the drain finished
    /// within the grace period.
    pub(crate) async fn close(&self, grace: Duration) -> bool {
        let drained = drain_in_flight(&self.in_flight, grace).await;
        self.shutdown.cancel();
        if !drained {
            debug!(
                backend = self.backend,
                "grace period elapsed with operations in flight, cancelling"
            );
        }
        drained
    }
}
