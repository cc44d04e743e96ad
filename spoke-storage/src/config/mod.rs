//! Environment-driven configuration loading and bootstrap validation.
//!
//! All keys share the `SPOKE_` prefix. Missing keys fall back to the
//! serde defaults in `types`; malformed values are fatal at bootstrap,
//! not silently ignored.

pub mod types;

pub use types::{
    BackendType, CachePolicyConfig, CacheTtlConfig, FilesystemConfig, MetadataStoreConfig,
    NetworkCacheConfig, ObjectStoreConfig, StorageConfig,
};

use crate::errors::ConfigError;
use std::str::FromStr;

impl StorageConfig {
    /// Load the full configuration from `SPOKE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = StorageConfig::default();

        if let Some(raw) = env_string("SPOKE_STORAGE_TYPE") {
            config.backend = BackendType::from_str(&raw).map_err(|reason| ConfigError::Invalid {
                key: "SPOKE_STORAGE_TYPE",
                reason,
            })?;
        }

        config.filesystem.root = env_string("SPOKE_FILESYSTEM_ROOT").map(Into::into);

        if let Some(url) = env_string("SPOKE_DATABASE_URL") {
            config.metadata.url = url;
        }
        if let Some(raw) = env_string("SPOKE_DATABASE_REPLICA_URLS") {
            config.metadata.replica_urls = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_parse("SPOKE_DATABASE_MAX_CONNS")? {
            config.metadata.max_conns = v;
        }
        if let Some(v) = env_parse("SPOKE_DATABASE_MIN_CONNS")? {
            config.metadata.min_conns = v;
        }
        if let Some(v) = env_parse("SPOKE_DATABASE_TIMEOUT_SECS")? {
            config.metadata.timeout_secs = v;
        }

        config.object_store.endpoint = env_string("SPOKE_OBJECT_STORE_ENDPOINT");
        if let Some(region) = env_string("SPOKE_OBJECT_STORE_REGION") {
            config.object_store.region = region;
        }
        if let Some(bucket) = env_string("SPOKE_OBJECT_STORE_BUCKET") {
            config.object_store.bucket = bucket;
        }
        if let Some(key) = env_string("SPOKE_OBJECT_STORE_ACCESS_KEY") {
            config.object_store.access_key = key;
        }
        if let Some(key) = env_string("SPOKE_OBJECT_STORE_SECRET_KEY") {
            config.object_store.secret_key = key;
        }
        if let Some(v) = env_bool("SPOKE_OBJECT_STORE_USE_PATH_STYLE")? {
            config.object_store.use_path_style = v;
        }
        if let Some(v) = env_bool("SPOKE_OBJECT_STORE_FORCE_PATH_STYLE")? {
            config.object_store.force_path_style = v;
        }

        config.network_cache.url = env_string("SPOKE_CACHE_URL");
        config.network_cache.password = env_string("SPOKE_CACHE_PASSWORD");
        if let Some(v) = env_parse("SPOKE_CACHE_DB")? {
            config.network_cache.db = v;
        }
        if let Some(v) = env_parse("SPOKE_CACHE_MAX_RETRIES")? {
            config.network_cache.max_retries = v;
        }
        if let Some(v) = env_parse("SPOKE_CACHE_POOL_SIZE")? {
            config.network_cache.pool_size = v;
        }

        if let Some(v) = env_bool("SPOKE_CACHE_ENABLED")? {
            config.cache.enabled = v;
        }
        if let Some(v) = env_parse("SPOKE_L1_CACHE_SIZE_BYTES")? {
            config.cache.l1_max_bytes = v;
        }
        let ttl = &mut config.cache.ttl;
        for (key, slot) in [
            ("SPOKE_CACHE_TTL_MODULE_SECS", &mut ttl.module_secs),
            ("SPOKE_CACHE_TTL_VERSION_SECS", &mut ttl.version_secs),
            (
                "SPOKE_CACHE_TTL_VERSION_FULL_SECS",
                &mut ttl.version_full_secs,
            ),
            (
                "SPOKE_CACHE_TTL_VERSION_LIST_SECS",
                &mut ttl.version_list_secs,
            ),
            ("SPOKE_CACHE_TTL_LATEST_SECS", &mut ttl.latest_secs),
            ("SPOKE_CACHE_TTL_COMPILED_SECS", &mut ttl.compiled_secs),
            (
                "SPOKE_CACHE_TTL_PROTO_CONTENT_SECS",
                &mut ttl.proto_content_secs,
            ),
            (
                "SPOKE_CACHE_TTL_DEPENDENCY_TREE_SECS",
                &mut ttl.dependency_tree_secs,
            ),
        ] {
            if let Some(v) = env_parse(key)? {
                *slot = v;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Bootstrap validation. Corrupt configuration is fatal; nothing is
    /// constructed from an invalid config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendType::Filesystem => {
                if self.filesystem.root.is_none() {
                    return Err(ConfigError::Missing("SPOKE_FILESYSTEM_ROOT"));
                }
            }
            BackendType::Postgres => {
                if self.metadata.url.is_empty() {
                    return Err(ConfigError::Missing("SPOKE_DATABASE_URL"));
                }
            }
            BackendType::Hybrid => {
                if self.metadata.url.is_empty() {
                    return Err(ConfigError::Missing("SPOKE_DATABASE_URL"));
                }
                if self.object_store.endpoint.is_none() {
                    return Err(ConfigError::Missing("SPOKE_OBJECT_STORE_ENDPOINT"));
                }
                if self.object_store.bucket.is_empty() {
                    return Err(ConfigError::Missing("SPOKE_OBJECT_STORE_BUCKET"));
                }
            }
        }

        if self.metadata.max_conns == 0 {
            return Err(ConfigError::Invalid {
                key: "SPOKE_DATABASE_MAX_CONNS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.metadata.min_conns > self.metadata.max_conns {
            return Err(ConfigError::Invalid {
                key: "SPOKE_DATABASE_MIN_CONNS",
                reason: format!(
                    "min connections {} exceed max connections {}",
                    self.metadata.min_conns, self.metadata.max_conns
                ),
            });
        }
        if self.cache.enabled && self.cache.l1_max_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "SPOKE_L1_CACHE_SIZE_BYTES",
                reason: "must be non-zero when the cache is enabled".to_string(),
            });
        }

        Ok(())
    }
}

fn env_string(key: &'static str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env_string(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(ConfigError::Invalid {
                key,
                reason: format!("expected a boolean, got {:?}", other),
            }),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_requires_root() {
        let mut config = StorageConfig::default();
        config.backend = BackendType::Filesystem;
        assert!(config.validate().is_err());

        config.filesystem.root = Some("/tmp/spoke".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_postgres_requires_metadata_url() {
        let mut config = StorageConfig::default();
        config.backend = BackendType::Postgres;
        assert!(config.validate().is_err());

        config.metadata.url = "postgres://localhost/spoke".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hybrid_requires_object_store() {
        let mut config = StorageConfig::default();
        config.backend = BackendType::Hybrid;
        config.metadata.url = "postgres://localhost/spoke".to_string();
        assert!(config.validate().is_err());

        config.object_store.endpoint = Some("http://localhost:9000".to_string());
        config.object_store.bucket = "spoke".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds_are_checked() {
        let mut config = StorageConfig::default();
        config.backend = BackendType::Postgres;
        config.metadata.url = "postgres://localhost/spoke".to_string();
        config.metadata.min_conns = 20;
        config.metadata.max_conns = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_either_path_style_flag_selects_path_style() {
        let mut os = ObjectStoreConfig::default();
        assert!(!os.path_style());
        os.use_path_style = true;
        assert!(os.path_style());
        os.use_path_style = false;
        os.force_path_style = true;
        assert!(os.path_style());
    }

    #[test]
    fn test_default_ttl_table_matches_policy() {
        let ttl = CacheTtlConfig::default();
        assert_eq!(ttl.module_secs, 3600);
        assert_eq!(ttl.version_full_secs, 1800);
        assert_eq!(ttl.version_list_secs, 300);
        assert_eq!(ttl.latest_secs, 60);
        assert_eq!(ttl.compiled_secs, 86400);
    }
}
