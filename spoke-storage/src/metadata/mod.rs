//! Relational metadata store.
//!
//! Owns the module, version, file-metadata and dependency rows. One pool
//! fronts the primary; read-only operations round-robin over optional
//! replica pools and fall back to the primary on a replica transport
//! fault. Every statement runs under a deadline equal to the tighter of
//! the context deadline and the configured per-query timeout, and entity
//! mutations are transactional: a dropped future rolls the transaction
//! back.

use crate::config::MetadataStoreConfig;
use crate::context::OpContext;
use crate::errors::StorageError;
use crate::health::HealthStatus;
use crate::types::{
    DependencyNode, Module, ModuleUpdate, ModuleVersion, NewModule, Page, PageRequest,
    VersionDependency, VersionFile, VersionState, VersionUpdate,
};
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Resolution depth guard for dependency trees. The graph is acyclic by
/// construction, so this only bounds pathological chains.
const MAX_DEPENDENCY_DEPTH: usize = 64;

pub struct MetadataStore {
    primary: PgPool,
    replicas: Vec<PgPool>,
    cursor: AtomicUsize,
    query_timeout: Duration,
}

#[derive(Debug, sqlx::FromRow)]
struct ModuleRow {
    name: String,
    display_name: String,
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ModuleRow> for Module {
    fn from(row: ModuleRow) -> Self {
        Module {
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    module_name: String,
    version: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl VersionRow {
    fn into_version(self) -> Result<ModuleVersion, StorageError> {
        let state = VersionState::parse(&self.state).ok_or_else(|| {
            StorageError::Internal(format!("unknown version state in store: {}", self.state))
        })?;
        Ok(ModuleVersion {
            module_name: self.module_name,
            version: self.version,
            state,
            files: Vec::new(),
            dependencies: Vec::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    path: String,
    content_hash: String,
    content_type: String,
    size: i64,
}

impl From<FileRow> for VersionFile {
    fn from(row: FileRow) -> Self {
        VersionFile {
            path: row.path,
            content_hash: row.content_hash,
            content_type: row.content_type,
            size: row.size.max(0) as u64,
            content: None,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DependencyRow {
    dep_module: String,
    dep_version: String,
    import_path: Option<String>,
}

impl From<DependencyRow> for VersionDependency {
    fn from(row: DependencyRow) -> Self {
        VersionDependency {
            module_name: row.dep_module,
            version: row.dep_version,
            import_path: row.import_path,
        }
    }
}

impl MetadataStore {
    /// Build the pools without touching the network; connectivity is
    /// established lazily by the first query or the health probe.
    pub fn connect(config: &MetadataStoreConfig) -> Result<Self, StorageError> {
        let primary = Self::pool(config, &config.url)?;
        let replicas = config
            .replica_urls
            .iter()
            .map(|url| Self::pool(config, url))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            primary,
            replicas,
            cursor: AtomicUsize::new(0),
            query_timeout: config.query_timeout(),
        })
    }

    fn pool(config: &MetadataStoreConfig, url: &str) -> Result<PgPool, StorageError> {
        PgPoolOptions::new()
            .max_connections(config.max_conns)
            .min_connections(config.min_conns)
            .acquire_timeout(config.query_timeout())
            .connect_lazy(url)
            .map_err(|e| StorageError::InvalidArgument(format!("metadata url: {}", e)))
    }

    pub fn primary_pool(&self) -> PgPool {
        self.primary.clone()
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Apply the embedded schema migrations against the primary.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.primary)
            .await
            .map_err(|e| StorageError::Internal(format!("migration: {}", e)))
    }

    fn read_pool(&self, read_only: bool) -> (PgPool, bool) {
        if read_only && !self.replicas.is_empty() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
            (self.replicas[index].clone(), true)
        } else {
            (self.primary.clone(), false)
        }
    }

    async fn bound<T>(
        &self,
        ctx: &OpContext,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StorageError> {
        let budget = ctx.query_deadline(self.query_timeout);
        ctx.bound_within(budget, fut)
            .await?
            .map_err(StorageError::from)
    }

    async fn bound_op<T>(
        &self,
        ctx: &OpContext,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let budget = ctx.query_deadline(self.query_timeout);
        ctx.bound_within(budget, fut).await?
    }

    /// Run a read-only query against the routed pool, falling back to the
    /// primary when a replica is unreachable.
    async fn with_read_pool<T, F, Fut>(
        &self,
        ctx: &OpContext,
        read_only: bool,
        query: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let (pool, used_replica) = self.read_pool(read_only);
        let first = self.bound(ctx, query(pool)).await;
        match first {
            Err(e) if e.is_transient() && used_replica => {
                warn!(error = %e, "replica query failed, falling back to primary");
                self.bound(ctx, query(self.primary.clone())).await
            }
            other => other,
        }
    }

    // ---- modules ----

    pub async fn create_module(
        &self,
        ctx: &OpContext,
        module: NewModule,
    ) -> Result<Module, StorageError> {
        let now = Utc::now();
        let result = self
            .bound(
                ctx,
                sqlx::query(
                    "INSERT INTO modules (name, display_name, description, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&module.name)
                .bind(&module.display_name)
                .bind(&module.description)
                .bind(now)
                .bind(now)
                .execute(&self.primary),
            )
            .await;
        match result {
            Ok(_) => Ok(Module {
                name: module.name,
                display_name: module.display_name,
                description: module.description,
                created_at: now,
                updated_at: now,
            }),
            Err(StorageError::AlreadyExists(_)) => Err(StorageError::AlreadyExists(format!(
                "module {}",
                module.name
            ))),
            Err(e) => Err(e),
        }
    }

    pub async fn get_module(
        &self,
        ctx: &OpContext,
        name: &str,
        read_only: bool,
    ) -> Result<Module, StorageError> {
        let row: Option<ModuleRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT name, display_name, description, created_at, updated_at \
                     FROM modules WHERE name = $1",
                )
                .bind(name)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        row.map(Module::from)
            .ok_or_else(|| StorageError::NotFound(format!("module {}", name)))
    }

    pub async fn module_exists(
        &self,
        ctx: &OpContext,
        name: &str,
        read_only: bool,
    ) -> Result<bool, StorageError> {
        let row: Option<(i32,)> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as("SELECT 1 FROM modules WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        Ok(row.is_some())
    }

    pub async fn update_module(
        &self,
        ctx: &OpContext,
        name: &str,
        update: ModuleUpdate,
    ) -> Result<Module, StorageError> {
        let now = Utc::now();
        let row: Option<ModuleRow> = self
            .bound(
                ctx,
                sqlx::query_as(
                    "UPDATE modules SET \
                        display_name = COALESCE($2, display_name), \
                        description = COALESCE($3, description), \
                        updated_at = $4 \
                     WHERE name = $1 \
                     RETURNING name, display_name, description, created_at, updated_at",
                )
                .bind(name)
                .bind(update.display_name.as_deref())
                .bind(update.description.as_deref())
                .bind(now)
                .fetch_optional(&self.primary),
            )
            .await?;
        row.map(Module::from)
            .ok_or_else(|| StorageError::NotFound(format!("module {}", name)))
    }

    pub async fn list_modules(
        &self,
        ctx: &OpContext,
        read_only: bool,
    ) -> Result<Vec<Module>, StorageError> {
        let rows: Vec<ModuleRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT name, display_name, description, created_at, updated_at \
                     FROM modules ORDER BY name",
                )
                .fetch_all(&pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(Module::from).collect())
    }

    pub async fn list_modules_paginated(
        &self,
        ctx: &OpContext,
        page: PageRequest,
        read_only: bool,
    ) -> Result<Page<Module>, StorageError> {
        let page = page.normalized();
        let (rows, total): (Vec<ModuleRow>, i64) = self
            .with_read_pool(ctx, read_only, |pool| async move {
                // One repeatable-read transaction so the page and the
                // total come from the same snapshot.
                let mut tx = pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                    .execute(&mut *tx)
                    .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM modules")
                    .fetch_one(&mut *tx)
                    .await?;
                let rows: Vec<ModuleRow> = sqlx::query_as(
                    "SELECT name, display_name, description, created_at, updated_at \
                     FROM modules ORDER BY name LIMIT $1 OFFSET $2",
                )
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok((rows, total))
            })
            .await?;
        Ok(Page {
            items: rows.into_iter().map(Module::from).collect(),
            total: total.max(0) as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    // ---- versions ----

    pub async fn create_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        state: VersionState,
        files: &[VersionFile],
        dependencies: &[VersionDependency],
    ) -> Result<ModuleVersion, StorageError> {
        let now = Utc::now();
        self.bound_op(ctx, async {
            let mut tx = self.primary.begin().await.map_err(StorageError::from)?;

            let module_exists: Option<(i32,)> =
                sqlx::query_as("SELECT 1 FROM modules WHERE name = $1")
                    .bind(module)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            if module_exists.is_none() {
                return Err(StorageError::NotFound(format!("module {}", module)));
            }

            for dep in dependencies {
                let dep_exists: Option<(i32,)> = sqlx::query_as(
                    "SELECT 1 FROM versions WHERE module_name = $1 AND version = $2",
                )
                .bind(&dep.module_name)
                .bind(&dep.version)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::from)?;
                if dep_exists.is_none() {
                    return Err(StorageError::Precondition(format!(
                        "dependency {}@{} is unresolvable",
                        dep.module_name, dep.version
                    )));
                }
            }

            let inserted = sqlx::query(
                "INSERT INTO versions (module_name, version, state, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(module)
            .bind(version)
            .bind(state.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await;
            if let Err(e) = inserted {
                return Err(match StorageError::from(e) {
                    StorageError::AlreadyExists(_) => {
                        StorageError::AlreadyExists(format!("version {}@{}", module, version))
                    }
                    other => other,
                });
            }

            for file in files {
                sqlx::query(
                    "INSERT INTO files (module_name, version, path, content_hash, content_type, size) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(module)
                .bind(version)
                .bind(&file.path)
                .bind(&file.content_hash)
                .bind(&file.content_type)
                .bind(file.size as i64)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
            }

            for dep in dependencies {
                sqlx::query(
                    "INSERT INTO dependencies (module_name, version, dep_module, dep_version, import_path) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(module)
                .bind(version)
                .bind(&dep.module_name)
                .bind(&dep.version)
                .bind(dep.import_path.as_deref())
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
            }

            tx.commit().await.map_err(StorageError::from)?;

            Ok(ModuleVersion {
                module_name: module.to_string(),
                version: version.to_string(),
                state,
                files: files.to_vec(),
                dependencies: dependencies.to_vec(),
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn get_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        read_only: bool,
    ) -> Result<ModuleVersion, StorageError> {
        let fetched: Option<(VersionRow, Vec<FileRow>, Vec<DependencyRow>)> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                let row: Option<VersionRow> = sqlx::query_as(
                    "SELECT module_name, version, state, created_at, updated_at \
                     FROM versions WHERE module_name = $1 AND version = $2",
                )
                .bind(module)
                .bind(version)
                .fetch_optional(&pool)
                .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let files: Vec<FileRow> = sqlx::query_as(
                    "SELECT path, content_hash, content_type, size \
                     FROM files WHERE module_name = $1 AND version = $2 ORDER BY path",
                )
                .bind(module)
                .bind(version)
                .fetch_all(&pool)
                .await?;
                let deps: Vec<DependencyRow> = sqlx::query_as(
                    "SELECT dep_module, dep_version, import_path \
                     FROM dependencies WHERE module_name = $1 AND version = $2 \
                     ORDER BY dep_module, import_path",
                )
                .bind(module)
                .bind(version)
                .fetch_all(&pool)
                .await?;
                Ok(Some((row, files, deps)))
            })
            .await?;

        let (row, files, deps) = fetched.ok_or_else(|| {
            StorageError::NotFound(format!("version {}@{}", module, version))
        })?;
        let mut entity = row.into_version()?;
        entity.files = files.into_iter().map(VersionFile::from).collect();
        entity.dependencies = deps.into_iter().map(VersionDependency::from).collect();
        Ok(entity)
    }

    pub async fn list_versions(
        &self,
        ctx: &OpContext,
        module: &str,
        read_only: bool,
    ) -> Result<Vec<ModuleVersion>, StorageError> {
        if !self.module_exists(ctx, module, read_only).await? {
            return Err(StorageError::NotFound(format!("module {}", module)));
        }
        let rows: Vec<VersionRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT module_name, version, state, created_at, updated_at \
                     FROM versions WHERE module_name = $1 \
                     ORDER BY created_at DESC, version DESC",
                )
                .bind(module)
                .fetch_all(&pool)
                .await
            })
            .await?;
        rows.into_iter().map(VersionRow::into_version).collect()
    }

    pub async fn list_versions_paginated(
        &self,
        ctx: &OpContext,
        module: &str,
        page: PageRequest,
        read_only: bool,
    ) -> Result<Page<ModuleVersion>, StorageError> {
        if !self.module_exists(ctx, module, read_only).await? {
            return Err(StorageError::NotFound(format!("module {}", module)));
        }
        let page = page.normalized();
        let (rows, total): (Vec<VersionRow>, i64) = self
            .with_read_pool(ctx, read_only, |pool| async move {
                let mut tx = pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                    .execute(&mut *tx)
                    .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE module_name = $1")
                        .bind(module)
                        .fetch_one(&mut *tx)
                        .await?;
                let rows: Vec<VersionRow> = sqlx::query_as(
                    "SELECT module_name, version, state, created_at, updated_at \
                     FROM versions WHERE module_name = $1 \
                     ORDER BY created_at DESC, version DESC LIMIT $2 OFFSET $3",
                )
                .bind(module)
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok((rows, total))
            })
            .await?;
        Ok(Page {
            items: rows
                .into_iter()
                .map(VersionRow::into_version)
                .collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn latest_version(
        &self,
        ctx: &OpContext,
        module: &str,
        read_only: bool,
    ) -> Result<ModuleVersion, StorageError> {
        let row: Option<VersionRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT module_name, version, state, created_at, updated_at \
                     FROM versions WHERE module_name = $1 \
                     ORDER BY created_at DESC, version DESC LIMIT 1",
                )
                .bind(module)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        row.ok_or_else(|| StorageError::NotFound(format!("no versions for module {}", module)))?
            .into_version()
    }

    pub async fn update_version(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        update: VersionUpdate,
    ) -> Result<ModuleVersion, StorageError> {
        self.bound_op(ctx, async {
            let mut tx = self.primary.begin().await.map_err(StorageError::from)?;

            let row: Option<VersionRow> = sqlx::query_as(
                "SELECT module_name, version, state, created_at, updated_at \
                 FROM versions WHERE module_name = $1 AND version = $2 FOR UPDATE",
            )
            .bind(module)
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from)?;
            let row = row.ok_or_else(|| {
                StorageError::NotFound(format!("version {}@{}", module, version))
            })?;
            let mut entity = row.into_version()?;

            if let Some(next) = update.state {
                if !entity.state.can_transition_to(next) {
                    return Err(StorageError::Precondition(format!(
                        "version {}@{} cannot transition from {} to {}",
                        module, version, entity.state, next
                    )));
                }
                let now = Utc::now();
                sqlx::query(
                    "UPDATE versions SET state = $3, updated_at = $4 \
                     WHERE module_name = $1 AND version = $2",
                )
                .bind(module)
                .bind(version)
                .bind(next.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
                entity.state = next;
                entity.updated_at = now;
            }

            let files: Vec<FileRow> = sqlx::query_as(
                "SELECT path, content_hash, content_type, size \
                 FROM files WHERE module_name = $1 AND version = $2 ORDER BY path",
            )
            .bind(module)
            .bind(version)
            .fetch_all(&mut *tx)
            .await
            .map_err(StorageError::from)?;
            let deps: Vec<DependencyRow> = sqlx::query_as(
                "SELECT dep_module, dep_version, import_path \
                 FROM dependencies WHERE module_name = $1 AND version = $2 \
                 ORDER BY dep_module, import_path",
            )
            .bind(module)
            .bind(version)
            .fetch_all(&mut *tx)
            .await
            .map_err(StorageError::from)?;

            tx.commit().await.map_err(StorageError::from)?;

            entity.files = files.into_iter().map(VersionFile::from).collect();
            entity.dependencies = deps.into_iter().map(VersionDependency::from).collect();
            Ok(entity)
        })
        .await
    }

    /// Version row without files or dependencies, for cheap existence
    /// and state checks. Rides the `version:<module>:<version>` cache
    /// family in the drivers.
    pub async fn get_version_summary(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        read_only: bool,
    ) -> Result<ModuleVersion, StorageError> {
        let row: Option<VersionRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT module_name, version, state, created_at, updated_at \
                     FROM versions WHERE module_name = $1 AND version = $2",
                )
                .bind(module)
                .bind(version)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        row.ok_or_else(|| StorageError::NotFound(format!("version {}@{}", module, version)))?
            .into_version()
    }

    async fn get_dependencies(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        read_only: bool,
    ) -> Result<Vec<VersionDependency>, StorageError> {
        let rows: Vec<DependencyRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT dep_module, dep_version, import_path \
                     FROM dependencies WHERE module_name = $1 AND version = $2 \
                     ORDER BY dep_module, import_path",
                )
                .bind(module)
                .bind(version)
                .fetch_all(&pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(VersionDependency::from).collect())
    }

    /// Resolve the full dependency tree rooted at `(module, version)`.
    /// Versions only ever depend on versions that already existed when
    /// they were created, so the graph is acyclic; shared subtrees are
    /// memoized instead of re-resolved.
    pub async fn dependency_tree(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        read_only: bool,
    ) -> Result<DependencyNode, StorageError> {
        // Surfaces NotFound for a missing root.
        self.get_version_summary(ctx, module, version, read_only)
            .await?;
        let mut memo = HashMap::new();
        self.resolve_node(ctx, module, version, None, read_only, 0, &mut memo)
            .await
    }

    #[async_recursion]
    async fn resolve_node(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        import_path: Option<String>,
        read_only: bool,
        depth: usize,
        memo: &mut HashMap<(String, String), Vec<DependencyNode>>,
    ) -> Result<DependencyNode, StorageError> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(StorageError::Precondition(format!(
                "dependency chain of {}@{} exceeds depth {}",
                module, version, MAX_DEPENDENCY_DEPTH
            )));
        }
        let key = (module.to_string(), version.to_string());
        let children = if let Some(children) = memo.get(&key) {
            children.clone()
        } else {
            let deps = self.get_dependencies(ctx, module, version, read_only).await?;
            let mut children = Vec::with_capacity(deps.len());
            for dep in deps {
                children.push(
                    self.resolve_node(
                        ctx,
                        &dep.module_name,
                        &dep.version,
                        dep.import_path,
                        read_only,
                        depth + 1,
                        memo,
                    )
                    .await?,
                );
            }
            memo.insert(key, children.clone());
            children
        };
        Ok(DependencyNode {
            module_name: module.to_string(),
            version: version.to_string(),
            import_path,
            dependencies: children,
        })
    }

    pub async fn get_file(
        &self,
        ctx: &OpContext,
        module: &str,
        version: &str,
        path: &str,
        read_only: bool,
    ) -> Result<VersionFile, StorageError> {
        let row: Option<FileRow> = self
            .with_read_pool(ctx, read_only, |pool| async move {
                sqlx::query_as(
                    "SELECT f.path, f.content_hash, f.content_type, f.size \
                     FROM files f \
                     JOIN versions v ON v.module_name = f.module_name AND v.version = f.version \
                     WHERE f.module_name = $1 AND f.version = $2 AND f.path = $3",
                )
                .bind(module)
                .bind(version)
                .bind(path)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        row.map(VersionFile::from).ok_or_else(|| {
            StorageError::NotFound(format!("file {} in {}@{}", path, module, version))
        })
    }

    // ---- health & teardown ----

    /// `SELECT 1` against the primary and every replica. Healthy iff the
    /// primary answers; a dead replica only degrades.
    pub async fn health_check(&self, ctx: &OpContext) -> Result<HealthStatus, StorageError> {
        self.bound(
            ctx,
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.primary),
        )
        .await?;

        let mut degraded = false;
        for (index, replica) in self.replicas.iter().enumerate() {
            let probe = self
                .bound(
                    ctx,
                    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(replica),
                )
                .await;
            if let Err(e) = probe {
                warn!(replica = index, error = %e, "metadata replica unhealthy");
                degraded = true;
            }
        }
        Ok(if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        })
    }

    pub async fn close(&self) {
        debug!("closing metadata pools");
        self.primary.close().await;
        for replica in &self.replicas {
            replica.close().await;
        }
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("replicas", &self.replicas.len())
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_replicas(count: usize) -> MetadataStore {
        let config = MetadataStoreConfig {
            url: "postgres://primary.invalid/spoke".to_string(),
            replica_urls: (0..count)
                .map(|i| format!("postgres://replica{}.invalid/spoke", i))
                .collect(),
            ..MetadataStoreConfig::default()
        };
        MetadataStore::connect(&config).expect("lazy pools")
    }

    #[tokio::test]
    async fn test_reads_round_robin_over_replicas() {
        let store = store_with_replicas(3);
        // The cursor advances once per routed read.
        for expected in [0usize, 1, 2, 0, 1] {
            let before = store.cursor.load(Ordering::Relaxed);
            let (_pool, used_replica) = store.read_pool(true);
            assert!(used_replica);
            assert_eq!(before % 3, expected);
        }
    }

    #[tokio::test]
    async fn test_writes_always_use_primary() {
        let store = store_with_replicas(2);
        let (_pool, used_replica) = store.read_pool(false);
        assert!(!used_replica);
        // Write routing must not advance the replica cursor.
        assert_eq!(store.cursor.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_no_replicas_falls_back_to_primary() {
        let store = store_with_replicas(0);
        let (_pool, used_replica) = store.read_pool(true);
        assert!(!used_replica);
    }
}
