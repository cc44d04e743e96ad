//! The storage facade: segregated sub-interfaces and their union.
//!
//! Callers depend on the narrowest capability they need (a documentation
//! renderer takes a `VersionReader`, an ingest path takes `VersionWriter +
//! FileStorage`). Backends implement the union `Storage` by composing the
//! pieces. Every method takes an `OpContext` first and is safe to call
//! from any number of concurrent tasks.

use crate::context::OpContext;
use crate::errors::StorageError;
use crate::health::HealthReport;
use crate::types::{
    DependencyNode, Module, ModuleUpdate, ModuleVersion, NewModule, NewVersion, Page,
    PageRequest, VersionFile, VersionUpdate,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Read access to module records.
#[async_trait]
pub trait ModuleReader: Send + Sync {
    /// Fetch one module by name. `NotFound` when it does not exist.
    async fn get_module(&self, ctx: &OpContext, name: &str) -> Result<Module, StorageError>;

    /// All modules ordered by name.
    async fn list_modules(&self, ctx: &OpContext) -> Result<Vec<Module>, StorageError>;

    /// One page of modules ordered by name, with the total count taken
    /// under the same snapshot.
    async fn list_modules_paginated(
        &self,
        ctx: &OpContext,
        page: PageRequest,
    ) -> Result<Page<Module>, StorageError>;
}

/// Write access to module records.
#[async_trait]
pub trait ModuleWriter: Send + Sync {
    /// Create a module. `AlreadyExists` on name collision,
    /// `InvalidArgument` on a malformed name. Invalidates the `module:*`
    /// key family.
    async fn create_module(
        &self,
        ctx: &OpContext,
        module: NewModule,
    ) -> Result<Module, StorageError>;

    /// Mutate module metadata (display name, description). The name is
    /// stable and cannot change.
    async fn update_module(
        &self,
        ctx: &OpContext,
        name: &str,
        update: ModuleUpdate,
    ) -> Result<Module, StorageError>;
}

/// Read access to versions and their files.
#[async_trait]
pub trait VersionReader: Send + Sync {
    /// Full version record: file metadata and declared dependencies.
    async fn get_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<ModuleVersion, StorageError>;

    /// Version summaries for a module, newest first.
    async fn list_versions(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<Vec<ModuleVersion>, StorageError>;

    async fn list_versions_paginated(
        &self,
        ctx: &OpContext,
        module: &str,
        page: PageRequest,
    ) -> Result<Page<ModuleVersion>, StorageError>;

    /// Most recently created version of a module. `NotFound` when the
    /// module has no versions.
    async fn latest_version(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<ModuleVersion, StorageError>;

    /// One file of one version, with content attached. Metadata comes
    /// from the cache or metadata store; bytes are fetched lazily by
    /// content hash.
    async fn get_file(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        path: &str,
    ) -> Result<VersionFile, StorageError>;

    /// The fully resolved dependency tree rooted at `(module, version)`.
    /// `NotFound` when the root version does not exist; `Precondition`
    /// when the chain exceeds the resolution depth limit.
    async fn dependency_tree(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<DependencyNode, StorageError>;
}

/// Write access to versions.
#[async_trait]
pub trait VersionWriter: Send + Sync {
    /// Create an immutable version snapshot. Transactional: every file
    /// row, dependency row and content blob commits, or none of them.
    /// `AlreadyExists` on a duplicate `(module, version)`, `NotFound`
    /// when the module is missing, `Precondition` when a declared
    /// dependency is unresolvable.
    async fn create_version(
        &self,
        ctx: &OpContext,
        version: NewVersion,
    ) -> Result<ModuleVersion, StorageError>;

    /// Update lifecycle state and metadata only; never touches files.
    /// `Precondition` when the requested state transition is not a
    /// forward move.
    async fn update_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        update: VersionUpdate,
    ) -> Result<ModuleVersion, StorageError>;
}

/// Content-addressed access to raw file bytes.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Raw bytes for a content hash. `NotFound` for an unknown hash.
    async fn get_file_content(
        &self,
        ctx: &OpContext,
        content_hash: &str,
    ) -> Result<Bytes, StorageError>;

    /// Stream content into the blob store and return its content hash.
    /// Idempotent: identical bytes always yield the same hash and a
    /// single stored blob.
    async fn put_file_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Opaque compiled artifacts keyed by `(module, version, language)`.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn get_compiled_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
    ) -> Result<Bytes, StorageError>;

    /// Atomically replaces any previous artifact under the same key.
    async fn put_compiled_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
        payload: Bytes,
    ) -> Result<(), StorageError>;
}

/// Explicit cache invalidation, used by the facade itself on writes and
/// exposed for operational tooling.
#[async_trait]
pub trait CacheManager: Send + Sync {
    /// Remove every cache entry matching the glob-style patterns from
    /// both cache levels. A network-cache failure is logged and metered
    /// but does not fail the call.
    async fn invalidate_cache(
        &self,
        ctx: &OpContext,
        patterns: &[String],
    ) -> Result<(), StorageError>;
}

/// Composite readiness/liveness over every attached substrate.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn health_check(&self, ctx: &OpContext) -> Result<HealthReport, StorageError>;
}

/// The full storage contract: the union of all sub-interfaces plus
/// teardown. Backends implement the pieces; consumers should prefer the
/// narrowest sub-trait that covers their needs.
#[async_trait]
pub trait Storage:
    ModuleReader
    + ModuleWriter
    + VersionReader
    + VersionWriter
    + FileStorage
    + ArtifactStorage
    + CacheManager
    + HealthChecker
{
    /// Drain in-flight operations up to the grace period, then release
    /// pools, clients and caches. Operations still running past the
    /// grace period observe `Canceled`.
    async fn close(&self, grace: Duration) -> Result<(), StorageError>;
}
