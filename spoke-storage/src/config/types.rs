//! Configuration types for the storage core.
//!
//! Every struct deserializes with serde and carries usable defaults, so a
//! config file, an environment loader and tests all build the same types.
//! Durations are plain integer seconds in configuration and converted at
//! the point of use.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which backend driver to construct at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Directory-rooted driver for development and low-dependency deployments.
    Filesystem,
    /// Relational metadata with content stored in the same database.
    Postgres,
    /// Relational metadata plus an S3-compatible object store. Production target.
    Hybrid,
}

impl Default for BackendType {
    fn default() -> Self {
        BackendType::Filesystem
    }
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Filesystem => "filesystem",
            BackendType::Postgres => "postgres",
            BackendType::Hybrid => "hybrid",
        }
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(BackendType::Filesystem),
            "postgres" => Ok(BackendType::Postgres),
            "hybrid" => Ok(BackendType::Hybrid),
            other => Err(format!(
                "unknown storage type {:?} (expected filesystem, postgres or hybrid)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Root directory for the filesystem driver. Created at bootstrap if
    /// absent; failure to create it is fatal.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    /// Primary connection URL. Writes and read-your-writes paths always
    /// land here.
    #[serde(default)]
    pub url: String,
    /// Optional read replicas; read-only operations round-robin over
    /// them and fall back to the primary.
    #[serde(default)]
    pub replica_urls: Vec<String>,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default)]
    pub min_conns: u32,
    /// Per-query timeout in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            replica_urls: Vec::new(),
            max_conns: default_max_conns(),
            min_conns: 0,
            timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl MetadataStoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Custom endpoint for S3-compatible backends; unset means AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub use_path_style: bool,
    #[serde(default)]
    pub force_path_style: bool,
}

impl ObjectStoreConfig {
    /// Either flag selects path-style addressing.
    pub fn path_style(&self) -> bool {
        self.use_path_style || self.force_path_style
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCacheConfig {
    /// Redis URL. Unset disables the L2 tier entirely.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_cache_retries")]
    pub max_retries: u32,
    /// Accepted for config-surface compatibility; the multiplexed
    /// connection manager does not pool.
    #[serde(default = "default_cache_pool_size")]
    pub pool_size: u32,
}

impl Default for NetworkCacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            password: None,
            db: 0,
            max_retries: default_cache_retries(),
            pool_size: default_cache_pool_size(),
        }
    }
}

/// TTLs per cache key family, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_hour_secs")]
    pub module_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub version_secs: u64,
    #[serde(default = "default_half_hour_secs")]
    pub version_full_secs: u64,
    #[serde(default = "default_five_minutes_secs")]
    pub version_list_secs: u64,
    #[serde(default = "default_minute_secs")]
    pub latest_secs: u64,
    #[serde(default = "default_day_secs")]
    pub compiled_secs: u64,
    #[serde(default = "default_day_secs")]
    pub proto_content_secs: u64,
    #[serde(default = "default_hour_secs")]
    pub dependency_tree_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            module_secs: default_hour_secs(),
            version_secs: default_hour_secs(),
            version_full_secs: default_half_hour_secs(),
            version_list_secs: default_five_minutes_secs(),
            latest_secs: default_minute_secs(),
            compiled_secs: default_day_secs(),
            proto_content_secs: default_day_secs(),
            dependency_tree_secs: default_hour_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// L1 capacity in bytes of serialized payload.
    #[serde(default = "default_l1_bytes")]
    pub l1_max_bytes: usize,
    #[serde(default)]
    pub ttl: CacheTtlConfig,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_max_bytes: default_l1_bytes(),
            ttl: CacheTtlConfig::default(),
        }
    }
}

/// Top-level storage configuration, typically loaded from the
/// environment at bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendType,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub metadata: MetadataStoreConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub network_cache: NetworkCacheConfig,
    #[serde(default)]
    pub cache: CachePolicyConfig,
}

fn default_max_conns() -> u32 {
    10
}

fn default_query_timeout_secs() -> u64 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cache_retries() -> u32 {
    3
}

fn default_cache_pool_size() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_l1_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_hour_secs() -> u64 {
    3600
}

fn default_half_hour_secs() -> u64 {
    1800
}

fn default_five_minutes_secs() -> u64 {
    300
}

fn default_minute_secs() -> u64 {
    60
}

fn default_day_secs() -> u64 {
    86400
}
