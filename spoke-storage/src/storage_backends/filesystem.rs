//! Filesystem backend driver.
//!
//! A directory root holding one directory per module:
//!
//! ```text
//! <root>/<module>/module.json
//! <root>/<module>/versions/<version>/version.json
//! <root>/<module>/versions/<version>/<file-path>
//! <root>/<module>/versions/<version>/.artifacts/<language>
//! <root>/.blobs/<hh>/<hh>/<rest>
//! ```
//!
//! Manifests are canonical JSON encodings of the entities; file content
//! is stored verbatim at its relative path and deduplicated into the
//! `.blobs` store by content hash. A per-module async lock serializes
//! writes to one module so `version.json` is never torn; reads are
//! unsynchronized. Manifest writes go through a temp file + rename, with
//! the version manifest written last as the commit point. Cache
//! invalidation is a no-op here and pagination is computed over the
//! sorted listing.

use crate::context::OpContext;
use crate::errors::StorageError;
use crate::health::{DependencyHealth, HealthReport, HealthStatus};
use crate::object_store::{content_hash, validate_content_hash, validate_language};
use crate::observability::StorageMetrics;
use crate::storage::{
    ArtifactStorage, CacheManager, FileStorage, HealthChecker, ModuleReader, ModuleWriter,
    Storage, VersionReader, VersionWriter,
};
use crate::storage_backends::OpRunner;
use crate::types::{
    validate_file_path, validate_module_name, validate_version_tag, DependencyNode, FileContent,
    Module, ModuleUpdate, ModuleVersion, NewModule, NewVersion, Page, PageRequest, VersionFile,
    VersionUpdate,
};
use async_recursion::async_recursion;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWriteExt};

const BACKEND_NAME: &str = "filesystem";
const MODULE_MANIFEST: &str = "module.json";
const VERSION_MANIFEST: &str = "version.json";
const VERSIONS_DIR: &str = "versions";
const ARTIFACTS_DIR: &str = ".artifacts";
const BLOBS_DIR: &str = ".blobs";

pub struct FilesystemBackend {
    root: PathBuf,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    metrics: Arc<StorageMetrics>,
    runner: OpRunner,
}

impl FilesystemBackend {
    /// Open (and create if needed) the storage root. Failure to create
    /// the root is fatal at bootstrap.
    pub fn open(root: impl Into<PathBuf>, metrics: Arc<StorageMetrics>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::Internal(format!("create root {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            locks: DashMap::new(),
            runner: OpRunner::new(BACKEND_NAME, Arc::clone(&metrics)),
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<StorageMetrics> {
        Arc::clone(&self.metrics)
    }

    // ---- layout ----

    fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(module)
    }

    fn module_manifest(&self, module: &str) -> PathBuf {
        self.module_dir(module).join(MODULE_MANIFEST)
    }

    fn versions_dir(&self, module: &str) -> PathBuf {
        self.module_dir(module).join(VERSIONS_DIR)
    }

    fn version_dir(&self, module: &str, version: &str) -> PathBuf {
        self.versions_dir(module).join(version)
    }

    fn version_manifest(&self, module: &str, version: &str) -> PathBuf {
        self.version_dir(module, version).join(VERSION_MANIFEST)
    }

    fn version_file_path(&self, module: &str, version: &str, rel: &str) -> PathBuf {
        self.version_dir(module, version).join(rel)
    }

    fn artifact_path(&self, module: &str, version: &str, language: &str) -> PathBuf {
        self.version_dir(module, version)
            .join(ARTIFACTS_DIR)
            .join(language)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash[4..])
    }

    // ---- plumbing ----

    fn module_lock(&self, module: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn run_op<T, F>(&self, ctx: &OpContext, op: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        self.runner.run(ctx, op, fut).await
    }

    async fn write_blob_if_absent(&self, hash: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(hash);
        if path_exists(&path).await {
            return Ok(());
        }
        atomic_write(&path, bytes).await
    }

    async fn load_version(
        &self,
        module: &str,
        version: &str,
    ) -> Result<ModuleVersion, StorageError> {
        read_json::<ModuleVersion>(&self.version_manifest(module, version))
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("version {}@{}", module, version)))
    }

    async fn load_versions_sorted(
        &self,
        module: &str,
    ) -> Result<Vec<ModuleVersion>, StorageError> {
        if read_json::<Module>(&self.module_manifest(module)).await?.is_none() {
            return Err(StorageError::NotFound(format!("module {}", module)));
        }
        let mut versions = Vec::new();
        let dir = self.versions_dir(module);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => {
                return Err(StorageError::Internal(format!(
                    "read {}: {}",
                    dir.display(),
                    e
                )))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Internal(format!("read {}: {}", dir.display(), e)))?
        {
            let manifest = entry.path().join(VERSION_MANIFEST);
            if let Some(version) = read_json::<ModuleVersion>(&manifest).await? {
                versions.push(version);
            }
        }
        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(versions)
    }

    async fn load_modules_sorted(&self) -> Result<Vec<Module>, StorageError> {
        let mut modules = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::Internal(format!("read root: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Internal(format!("read root: {}", e)))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(module) = read_json::<Module>(&entry.path().join(MODULE_MANIFEST)).await? {
                modules.push(module);
            }
        }
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    #[async_recursion]
    async fn resolve_dependency_node(
        &self,
        module: &str,
        version: &str,
        import_path: Option<String>,
        depth: usize,
    ) -> Result<DependencyNode, StorageError> {
        const MAX_DEPTH: usize = 64;
        if depth > MAX_DEPTH {
            return Err(StorageError::Precondition(format!(
                "dependency chain of {}@{} exceeds depth {}",
                module, version, MAX_DEPTH
            )));
        }
        let entity = self.load_version(module, version).await?;
        let mut children = Vec::with_capacity(entity.dependencies.len());
        for dep in entity.dependencies {
            children.push(
                self.resolve_dependency_node(
                    &dep.module_name,
                    &dep.version,
                    dep.import_path,
                    depth + 1,
                )
                .await?,
            );
        }
        Ok(DependencyNode {
            module_name: module.to_string(),
            version: version.to_string(),
            import_path,
            dependencies: children,
        })
    }

    async fn probe_root(&self) -> Result<(), StorageError> {
        let token = self
            .root
            .join(format!(".healthcheck-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&token, b"ok")
            .await
            .map_err(|e| StorageError::Unavailable(format!("root not writable: {}", e)))?;
        tokio::fs::remove_file(&token)
            .await
            .map_err(|e| StorageError::Unavailable(format!("root not writable: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ModuleReader for FilesystemBackend {
    async fn get_module(&self, ctx: &OpContext, name: &str) -> Result<Module, StorageError> {
        self.run_op(ctx, "get_module", async {
            validate_module_name(name)?;
            read_json::<Module>(&self.module_manifest(name))
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("module {}", name)))
        })
        .await
    }

    async fn list_modules(&self, ctx: &OpContext) -> Result<Vec<Module>, StorageError> {
        self.run_op(ctx, "list_modules", self.load_modules_sorted()).await
    }

    async fn list_modules_paginated(
        &self,
        ctx: &OpContext,
        page: PageRequest,
    ) -> Result<Page<Module>, StorageError> {
        self.run_op(ctx, "list_modules_paginated", async {
            let page = page.normalized();
            let modules = self.load_modules_sorted().await?;
            Ok(paginate(modules, page))
        })
        .await
    }
}

#[async_trait]
impl ModuleWriter for FilesystemBackend {
    async fn create_module(
        &self,
        ctx: &OpContext,
        module: NewModule,
    ) -> Result<Module, StorageError> {
        self.run_op(ctx, "create_module", async {
            module.validate()?;
            let lock = self.module_lock(&module.name);
            let _guard = lock.lock().await;

            let manifest = self.module_manifest(&module.name);
            if path_exists(&manifest).await {
                return Err(StorageError::AlreadyExists(format!("module {}", module.name)));
            }
            let now = Utc::now();
            let entity = Module {
                name: module.name,
                display_name: module.display_name,
                description: module.description,
                created_at: now,
                updated_at: now,
            };
            write_json(&manifest, &entity).await?;
            Ok(entity)
        })
        .await
    }

    async fn update_module(
        &self,
        ctx: &OpContext,
        name: &str,
        update: ModuleUpdate,
    ) -> Result<Module, StorageError> {
        self.run_op(ctx, "update_module", async {
            validate_module_name(name)?;
            let lock = self.module_lock(name);
            let _guard = lock.lock().await;

            let manifest = self.module_manifest(name);
            let mut entity = read_json::<Module>(&manifest)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("module {}", name)))?;
            if let Some(display_name) = update.display_name {
                entity.display_name = display_name;
            }
            if let Some(description) = update.description {
                entity.description = description;
            }
            entity.updated_at = Utc::now();
            write_json(&manifest, &entity).await?;
            Ok(entity)
        })
        .await
    }
}

#[async_trait]
impl VersionReader for FilesystemBackend {
    async fn get_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
    ) -> Result<ModuleVersion, StorageError> {
        self.run_op(ctx, "get_version", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            self.load_version(module, version).await
        })
        .await
    }

    async fn list_versions(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<Vec<ModuleVersion>, StorageError> {
        self.run_op(ctx, "list_versions", async {
            validate_module_name(module)?;
            let versions = self.load_versions_sorted(module).await?;
            Ok(versions.iter().map(ModuleVersion::summary).collect())
        })
        .await
    }

    async fn list_versions_paginated(
        &self,
        ctx: &OpContext,
        module: &str,
        page: PageRequest,
    ) -> Result<Page<ModuleVersion>, StorageError> {
        self.run_op(ctx, "list_versions_paginated", async {
            validate_module_name(module)?;
            let page = page.normalized();
            let versions = self.load_versions_sorted(module).await?;
            let summaries = versions.iter().map(ModuleVersion::summary).collect();
            Ok(paginate(summaries, page))
        })
        .await
    }

    async fn latest_version(
        &self,
        ctx: &OpContext,
        module: &str,
    ) -> Result<ModuleVersion, StorageError> {
        self.run_op(ctx, "latest_version", async {
            validate_module_name(module)?;
            self.load_versions_sorted(module)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    StorageError::NotFound(format!("no versions for module {}", module))
                })
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
        self.run_op(ctx, "get_file", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            validate_file_path(path)?;

            let entity = self.load_version(module, version).await?;
            let mut file = entity
                .files
                .into_iter()
                .find(|f| f.path == path)
                .ok_or_else(|| {
                    StorageError::NotFound(format!("file {} in {}@{}", path, module, version))
                })?;

            let disk_path = self.version_file_path(module, version, path);
            let bytes = tokio::fs::read(&disk_path).await.map_err(|e| {
                StorageError::Internal(format!("read {}: {}", disk_path.display(), e))
            })?;
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
        self.run_op(ctx, "dependency_tree", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            self.resolve_dependency_node(module, version, None, 0).await
        })
        .await
    }
}

#[async_trait]
impl VersionWriter for FilesystemBackend {
    async fn create_version(
        &self,
        ctx: &OpContext,
        version: NewVersion,
    ) -> Result<ModuleVersion, StorageError> {
        self.run_op(ctx, "create_version", async {
            version.validate()?;
            let lock = self.module_lock(&version.module_name);
            let _guard = lock.lock().await;

            if !path_exists(&self.module_manifest(&version.module_name)).await {
                return Err(StorageError::NotFound(format!(
                    "module {}",
                    version.module_name
                )));
            }
            let manifest = self.version_manifest(&version.module_name, &version.version);
            if path_exists(&manifest).await {
                return Err(StorageError::AlreadyExists(format!(
                    "version {}@{}",
                    version.module_name, version.version
                )));
            }
            for dep in &version.dependencies {
                if !path_exists(&self.version_manifest(&dep.module_name, &dep.version)).await {
                    return Err(StorageError::Precondition(format!(
                        "dependency {}@{} is unresolvable",
                        dep.module_name, dep.version
                    )));
                }
            }

            let version_dir = self.version_dir(&version.module_name, &version.version);
            let written = async {
                let now = Utc::now();
                let mut files = Vec::with_capacity(version.files.len());
                for file in &version.files {
                    let bytes = file.content.to_bytes()?;
                    let hash = content_hash(&bytes);
                    self.write_blob_if_absent(&hash, &bytes).await?;
                    atomic_write(
                        &self.version_file_path(&version.module_name, &version.version, &file.path),
                        &bytes,
                    )
                    .await?;
                    files.push(VersionFile {
                        path: file.path.clone(),
                        content_hash: hash,
                        content_type: file.content_type.clone(),
                        size: bytes.len() as u64,
                        content: None,
                    });
                }
                let entity = ModuleVersion {
                    module_name: version.module_name.clone(),
                    version: version.version.clone(),
                    state: version.state,
                    files,
                    dependencies: version.dependencies.clone(),
                    created_at: now,
                    updated_at: now,
                };
                // The manifest is the commit point: a version without one
                // does not exist.
                write_json(&manifest, &entity).await?;
                Ok(entity)
            }
            .await;

            if written.is_err() {
                let _ = tokio::fs::remove_dir_all(&version_dir).await;
            }
            written
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
        self.run_op(ctx, "update_version", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            let lock = self.module_lock(module);
            let _guard = lock.lock().await;

            let mut entity = self.load_version(module, version).await?;
            if let Some(next) = update.state {
                if !entity.state.can_transition_to(next) {
                    return Err(StorageError::Precondition(format!(
                        "version {}@{} cannot transition from {} to {}",
                        module, version, entity.state, next
                    )));
                }
                entity.state = next;
                entity.updated_at = Utc::now();
                write_json(&self.version_manifest(module, version), &entity).await?;
            }
            Ok(entity)
        })
        .await
    }
}

#[async_trait]
impl FileStorage for FilesystemBackend {
    async fn get_file_content(
        &self,
        ctx: &OpContext,
        content_hash: &str,
    ) -> Result<Bytes, StorageError> {
        self.run_op(ctx, "get_file_content", async {
            validate_content_hash(content_hash)?;
            let path = self.blob_path(content_hash);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Bytes::from(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                    StorageError::NotFound(format!("content {}", content_hash)),
                ),
                Err(e) => Err(StorageError::Internal(format!(
                    "read {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
        .await
    }

    async fn put_file_content(
        &self,
        ctx: &OpContext,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _content_type: &str,
    ) -> Result<String, StorageError> {
        // Hash while draining the reader, then dedup on the blob path.
        let (bytes, hash) = crate::object_store::read_all_hashed(ctx, reader).await?;
        self.run_op(ctx, "put_file_content", async {
            self.write_blob_if_absent(&hash, &bytes).await?;
            Ok(hash.clone())
        })
        .await
    }
}

#[async_trait]
impl ArtifactStorage for FilesystemBackend {
    async fn get_compiled_artifact(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        language: &str,
    ) -> Result<Bytes, StorageError> {
        self.run_op(ctx, "get_compiled_artifact", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            validate_language(language)?;
            let path = self.artifact_path(module, version, language);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Bytes::from(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound(format!(
                        "artifact {}/{}/{}",
                        module, version, language
                    )))
                }
                Err(e) => Err(StorageError::Internal(format!(
                    "read {}: {}",
                    path.display(),
                    e
                ))),
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
        self.run_op(ctx, "put_compiled_artifact", async {
            validate_module_name(module)?;
            validate_version_tag(version)?;
            validate_language(language)?;
            if !path_exists(&self.version_manifest(module, version)).await {
                return Err(StorageError::NotFound(format!(
                    "version {}@{}",
                    module, version
                )));
            }
            atomic_write(&self.artifact_path(module, version, language), &payload).await
        })
        .await
    }
}

#[async_trait]
impl CacheManager for FilesystemBackend {
    async fn invalidate_cache(
        &self,
        _ctx: &OpContext,
        _patterns: &[String],
    ) -> Result<(), StorageError> {
        // No cache tiers are attached to this driver.
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for FilesystemBackend {
    async fn health_check(&self, ctx: &OpContext) -> Result<HealthReport, StorageError> {
        self.run_op(ctx, "health_check", async {
            let started = Instant::now();
            let (status, message) = match self.probe_root().await {
                Ok(()) => (HealthStatus::Healthy, None),
                Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            };
            Ok(HealthReport {
                status,
                checks: vec![DependencyHealth {
                    name: "filesystem".to_string(),
                    status,
                    message,
                    latency_ms: started.elapsed().as_millis() as u64,
                    checked_at: Utc::now(),
                }],
            })
        })
        .await
    }
}

#[async_trait]
impl Storage for FilesystemBackend {
    async fn close(&self, grace: Duration) -> Result<(), StorageError> {
        self.runner.close(grace).await;
        self.locks.clear();
        Ok(())
    }
}

impl std::fmt::Debug for FilesystemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemBackend")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn paginate<T>(items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect();
    Page {
        items,
        total,
        limit: page.limit,
        offset: page.offset,
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Internal(format!(
            "read {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let encoded = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &encoded).await
}

/// Write to a temp file in the target directory, fsync, then rename into
/// place so readers never observe a torn manifest.
async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Internal(format!("no parent for {}", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::Internal(format!("mkdir {}: {}", parent.display(), e)))?;
    let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok::<_, std::io::Error>(())
    }
    .await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StorageError::Internal(format!(
            "write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}
