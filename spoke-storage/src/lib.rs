// spoke-storage
// Storage core for the spoke protobuf schema registry: entity metadata,
// content-addressed blobs, compiled artifacts, a two-level cache and
// composite health, behind one facade.

pub mod cache;
pub mod config;
pub mod context;
pub mod errors;
pub mod health;
pub mod metadata;
pub mod object_store;
pub mod observability;
pub mod storage;
pub mod storage_backends;
pub mod types;

// Re-export the facade surface most callers need.
pub use crate::config::{BackendType, StorageConfig};
pub use crate::context::OpContext;
pub use crate::errors::{ConfigError, StorageError};
pub use crate::health::{HealthReport, HealthStatus};
pub use crate::storage::{
    ArtifactStorage, CacheManager, FileStorage, HealthChecker, ModuleReader, ModuleWriter,
    Storage, VersionReader, VersionWriter,
};
pub use crate::storage_backends::build_storage;
pub use crate::types::{
    DependencyNode, FileContent, Module, ModuleUpdate, ModuleVersion, NewModule, NewVersion,
    NewVersionFile, Page, PageRequest, VersionDependency, VersionFile, VersionState,
    VersionUpdate,
};
