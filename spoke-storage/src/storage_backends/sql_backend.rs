//! Relational and hybrid backend drivers.
//!
//! One driver struct covers both flavors: the metadata store owns entity
//! rows in either case, and the blob store seam decides where bytes live
//! (a `contents` table for the plain `postgres` driver, the object store
//! for `hybrid`). Reads go through the cache tier when it is attached;
//! every mutation invalidates the affected key patterns across both
//! cache levels before the operation returns.
//!
//! Content blobs are uploaded before the metadata transaction commits.
//! They are content-addressed and idempotent, so a failed transaction
//! leaves at worst unreferenced blobs for the external GC, never a
//! version whose content is missing.

use crate::cache::{keys, TieredCache};
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::health::{HealthAggregator, HealthProbe, HealthReport, HealthStatus};
use crate::metadata::MetadataStore;
use crate::object_store::BlobStore;
use crate::observability::StorageMetrics;
use crate::storage::{
    ArtifactStorage, CacheManager, FileStorage, HealthChecker, ModuleReader, ModuleWriter,
    Storage, VersionReader, VersionWriter,
};
use crate::storage_backends::OpRunner;
use crate::types::{
    validate_file_path, validate_module_name, validate_version_tag, DependencyNode, FileContent,
    Module, ModuleUpdate, ModuleVersion, NewModule, NewVersion, Page, PageRequest, VersionFile,
    VersionState, VersionUpdate,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

pub struct SqlBackend {
    meta: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Option<Arc<TieredCache>>,
    metrics: Arc<StorageMetrics>,
    runner: OpRunner,
    health: HealthAggregator,
}

struct MetadataProbe(Arc<MetadataStore>);

#[async_trait]
impl HealthProbe for MetadataProbe {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn probe(&self, ctx: &OpContext) -> Result<HealthStatus, StorageError> {
        self.0.health_check(ctx).await
    }
}

struct ObjectStoreProbe(Arc<dyn BlobStore>);

#[async_trait]
impl HealthProbe for ObjectStoreProbe {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn probe(&self, ctx: &OpContext) -> Result<HealthStatus, StorageError> {
        self.0.health_check(ctx).await?;
        Ok(HealthStatus::Healthy)
    }
}

struct NetworkCacheProbe(Arc<TieredCache>);

#[async_trait]
impl HealthProbe for NetworkCacheProbe {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn probe(&self, ctx: &OpContext) -> Result<HealthStatus, StorageError> {
        self.0.l2_ping(ctx).await?;
        Ok(HealthStatus::Healthy)
    }
}

impl SqlBackend {
    pub fn new(
        meta: Arc<MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Option<Arc<TieredCache>>,
        metrics: Arc<StorageMetrics>,
        backend_label: &'static str,
        probe_object_store: bool,
    ) -> Self {
        let mut health =
            HealthAggregator::new().register(Arc::new(MetadataProbe(Arc::clone(&meta))), true);
        if probe_object_store {
            health = health.register(Arc::new(ObjectStoreProbe(Arc::clone(&blobs))), false);
        }
        if let Some(cache) = cache.as_ref().filter(|c| c.has_l2()) {
            health = health.register(Arc::new(NetworkCacheProbe(Arc::clone(cache))), false);
        }
        Self {
            runner: OpRunner::new(backend_label, Arc::clone(&metrics)),
            meta,
            blobs,
            cache,
            metrics,
            health,
        }
    }

    pub fn metrics(&self) -> Arc<StorageMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Apply the embedded schema migrations. Invoked by deployments that
    /// let the registry own its schema; managed schemas skip it.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        self.meta.run_migrations().await
    }

    async fn invalidate(&self, ctx: &OpContext, patterns: Vec<String>) {
        if let Some(cache) = &self.cache {
            cache.invalidate(ctx, &patterns).await;
        }
    }

    /// Version row without files, read through the `version:` key family.
    async fn version_summary(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<ModuleVersion, StorageError> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_with(ctx, &keys::version_key(module, version), || {
                        self.meta.get_version_summary(ctx, module, version, true)
                    })
                    .await
            }
            None => self.meta.get_version_summary(ctx, module, version, true).await,
        }
    }
}

#[async_trait]
impl ModuleReader for SqlBackend {
    async fn get_module(&self, ctx: &OpContext, name: &str) -> Result<Module, StorageError> {
        self.runner
            .run(ctx, "get_module", async {
                validate_module_name(name)?;
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_with(ctx, &keys::module_key(name), || {
                                self.meta.get_module(ctx, name, true)
                            })
                            .await
                    }
                    None => self.meta.get_module(ctx, name, true).await,
                }
            })
            .await
    }

    async fn list_modules(&self, ctx: &OpContext) -> Result<Vec<Module>, StorageError> {
        self.runner
            .run(ctx, "list_modules", self.meta.list_modules(ctx, true))
            .await
    }

    async fn list_modules_paginated(
        &self,
        ctx: &OpContext,
        page: PageRequest,
    ) -> Result<Page<Module>, StorageError> {
        self.runner
            .run(
                ctx,
                "list_modules_paginated",
                self.meta.list_modules_paginated(ctx, page, true),
            )
            .await
    }
}

#[async_trait]
impl ModuleWriter for SqlBackend {
    async fn create_module(
        &self,
        ctx: &OpContext,
        module: NewModule,
    ) -> Result<Module, StorageError> {
        self.runner
            .run(ctx, "create_module", async {
                module.validate()?;
                let created = self.meta.create_module(ctx, module).await?;
                self.invalidate(ctx, vec!["module:*".to_string()]).await;
                Ok(created)
            })
            .await
    }

    async fn update_module(
        &self,
        ctx: &OpContext,
        name: &str,
        update: ModuleUpdate,
    ) -> Result<Module, StorageError> {
        self.runner
            .run(ctx, "update_module", async {
                validate_module_name(name)?;
                let updated = self.meta.update_module(ctx, name, update).await?;
                self.invalidate(ctx, vec![keys::module_key(name)]).await;
                Ok(updated)
            })
            .await
    }
}

#[async_trait]
impl VersionReader for SqlBackend {
    async fn get_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<ModuleVersion, StorageError> {
        self.runner
            .run(ctx, "get_version", async {
                validate_module_name(module)?;
                validate_version_tag(version)?;
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_with(ctx, &keys::version_full_key(module, version), || {
                                self.meta.get_version(ctx, module, version, true)
                            })
                            .await
                    }
                    None => self.meta.get_version(ctx, module, version, true).await,
                }
            })
            .await
    }

    async fn list_versions(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<Vec<ModuleVersion>, StorageError> {
        self.runner
            .run(ctx, "list_versions", async {
                validate_module_name(module)?;
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_with(ctx, &keys::version_list_key(module), || {
                                self.meta.list_versions(ctx, module, true)
                            })
                            .await
                    }
                    None => self.meta.list_versions(ctx, module, true).await,
                }
            })
            .await
    }

    async fn list_versions_paginated(
        &self,
        ctx: &OpContext,
        module: &str,
        page: PageRequest,
    ) -> Result<Page<ModuleVersion>, StorageError> {
        self.runner
            .run(ctx, "list_versions_paginated", async {
                validate_module_name(module)?;
                self.meta
                    .list_versions_paginated(ctx, module, page, true)
                    .await
            })
            .await
    }

    async fn latest_version(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<ModuleVersion, StorageError> {
        self.runner
            .run(ctx, "latest_version", async {
                validate_module_name(module)?;
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_with(ctx, &keys::latest_key(module), || {
                                self.meta.latest_version(ctx, module, true)
                            })
                            .await
                    }
                    None => self.meta.latest_version(ctx, module, true).await,
                }
            })
            .await
    }

    async fn get_file(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        path: &str,
    ) -> Result<VersionFile, StorageError> {
        self.runner
            .run(ctx, "get_file", async {
                validate_module_name(module)?;
                validate_version_tag(version)?;
                validate_file_path(path)?;

                let mut file = self.meta.get_file(ctx, module, version, path, true).await?;
                let bytes = self.load_content(ctx, &file.content_hash).await?;
                file.content = Some(FileContent::from_bytes(&file.content_type, &bytes));
                Ok(file)
            })
            .await
    }

    async fn dependency_tree(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<DependencyNode, StorageError> {
        self.runner
            .run(ctx, "dependency_tree", async {
                validate_module_name(module)?;
                validate_version_tag(version)?;
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_with(ctx, &keys::dependency_tree_key(module, version), || {
                                self.meta.dependency_tree(ctx, module, version, true)
                            })
                            .await
                    }
                    None => self.meta.dependency_tree(ctx, module, version, true).await,
                }
            })
            .await
    }
}

#[async_trait]
impl VersionWriter for SqlBackend {
    async fn create_version(
        &self,
        ctx: &OpContext,
        version: NewVersion,
    ) -> Result<ModuleVersion, StorageError> {
        self.runner
            .run(ctx, "create_version", async {
                version.validate()?;

                // Upload blobs first; content addressing makes this safe
                // to repeat and the transaction below is the commit point.
                let mut files = Vec::with_capacity(version.files.len());
                for file in &version.files {
                    let bytes = file.content.to_bytes()?;
                    let mut reader: &[u8] = &bytes;
                    let hash = self
                        .blobs
                        .put_content(ctx, &mut reader, &file.content_type)
                        .await?;
                    files.push(VersionFile {
                        path: file.path.clone(),
                        content_hash: hash,
                        content_type: file.content_type.clone(),
                        size: bytes.len() as u64,
                        content: None,
                    });
                }

                let created = self
                    .meta
                    .create_version(
                        ctx,
                        &version.module_name,
                        &version.version,
                        version.state,
                        &files,
                        &version.dependencies,
                    )
                    .await?;

                self.invalidate(
                    ctx,
                    vec![
                        keys::version_list_key(&version.module_name),
                        keys::latest_key(&version.module_name),
                        format!("version_full:{}:*", version.module_name),
                    ],
                )
                .await;
                Ok(created)
            })
            .await
    }

    async fn update_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        update: VersionUpdate,
    ) -> Result<ModuleVersion, StorageError> {
        self.runner
            .run(ctx, "update_version", async {
                validate_module_name(module)?;
                validate_version_tag(version)?;

                let published = update.state == Some(VersionState::Published);
                let updated = self.meta.update_version(ctx, module, version, update).await?;

                let mut patterns = vec![
                    keys::version_key(module, version),
                    keys::version_full_key(module, version),
                    keys::version_list_key(module),
                    keys::latest_key(module),
                    keys::dependency_tree_key(module, version),
                ];
                if published {
                    // A draft that just published froze its file set; any
                    // artifact compiled from the draft is stale.
                    patterns.push(format!("compiled:{}:{}:*", module, version));
                }
                self.invalidate(ctx, patterns).await;
                Ok(updated)
            })
            .await
    }
}

impl SqlBackend {
    async fn load_content(&self, ctx: &OpContext, hash: &str) -> Result<Bytes, StorageError> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_bytes_with(ctx, &keys::proto_content_key(hash), || {
                        self.blobs.get_content(ctx, hash)
                    })
                    .await
            }
            None => self.blobs.get_content(ctx, hash).await,
        }
    }
}

#[async_trait]
impl FileStorage for SqlBackend {
    async fn get_file_content(
        &self,
        ctx: &OpContext,
        content_hash: &str,
    ) -> Result<Bytes, StorageError> {
        self.runner
            .run(
                ctx,
                "get_file_content",
                self.load_content(ctx, content_hash),
            )
            .await
    }

    async fn put_file_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.runner
            .run(
                ctx,
                "put_file_content",
                self.blobs.put_content(ctx, reader, content_type),
            )
            .await
    }
}

#[async_trait]
impl ArtifactStorage for SqlBackend {
    async fn get_compiled_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
    ) -> Result<Bytes, StorageError> {
        self.runner
            .run(ctx, "get_compiled_artifact", async {
                match &self.cache {
                    Some(cache) => {
                        cache
                            .get_bytes_with(ctx, &keys::compiled_key(module, version, language), || {
                                self.blobs.get_artifact(ctx, module, version, language)
                            })
                            .await
                    }
                    None => self.blobs.get_artifact(ctx, module, version, language).await,
                }
            })
            .await
    }

    async fn put_compiled_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
        payload: Bytes,
    ) -> Result<(), StorageError> {
        self.runner
            .run(ctx, "put_compiled_artifact", async {
                // Surfaces NotFound when the version does not exist.
                self.version_summary(ctx, module, version).await?;
                self.blobs
                    .put_artifact(ctx, module, version, language, payload)
                    .await?;
                self.invalidate(ctx, vec![keys::compiled_key(module, version, language)])
                    .await;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl CacheManager for SqlBackend {
    async fn invalidate_cache(
        &self,
        ctx: &OpContext,
        patterns: &[String],
    ) -> Result<(), StorageError> {
        self.runner
            .run(ctx, "invalidate_cache", async {
                self.invalidate(ctx, patterns.to_vec()).await;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl HealthChecker for SqlBackend {
    async fn health_check(&self, ctx: &OpContext) -> Result<HealthReport, StorageError> {
        self.runner
            .run(ctx, "health_check", async { Ok(self.health.check(ctx).await) })
            .await
    }
}

#[async_trait]
impl Storage for SqlBackend {
    async fn close(&self, grace: Duration) -> Result<(), StorageError> {
        self.runner.close(grace).await;
        self.meta.close().await;
        self.blobs.close().await;
        if let Some(cache) = &self.cache {
            cache.clear_local();
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBackend")
            .field("blobs", &self.blobs.backend_name())
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}
