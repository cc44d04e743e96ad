//! Bootstrap: configuration loading, validation and backend selection.

use spoke_storage::{build_storage, BackendType, NewModule, OpContext, StorageConfig};

#[tokio::test]
async fn test_build_filesystem_storage_from_config() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = StorageConfig::default();
    config.backend = BackendType::Filesystem;
    config.filesystem.root = Some(dir.path().to_path_buf());

    let storage = build_storage(&config).await?;
    let ctx = OpContext::for_request();
    storage
        .create_module(
            &ctx,
            NewModule {
                name: "acme".to_string(),
                display_name: "Acme".to_string(),
                description: String::new(),
            },
        )
        .await?;
    let module = storage.get_module(&ctx, "acme").await?;
    assert_eq!(module.name, "acme");
    Ok(())
}

#[tokio::test]
async fn test_corrupt_config_is_fatal() {
    let config = StorageConfig {
        backend: BackendType::Filesystem,
        ..StorageConfig::default()
    };
    assert!(build_storage(&config).await.is_err());
}

#[tokio::test]
async fn test_from_env_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("SPOKE_STORAGE_TYPE", "filesystem");
    std::env::set_var("SPOKE_FILESYSTEM_ROOT", dir.path());
    std::env::set_var("SPOKE_CACHE_ENABLED", "false");
    std::env::set_var("SPOKE_CACHE_TTL_LATEST_SECS", "15");
    std::env::set_var("SPOKE_DATABASE_REPLICA_URLS", "postgres://r1/s, postgres://r2/s");

    let config = StorageConfig::from_env().expect("load config");
    assert_eq!(config.backend, BackendType::Filesystem);
    assert_eq!(
        config.filesystem.root.as_deref(),
        Some(dir.path())
    );
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.ttl.latest_secs, 15);
    assert_eq!(
        config.metadata.replica_urls,
        vec!["postgres://r1/s".to_string(), "postgres://r2/s".to_string()]
    );

    for key in [
        "SPOKE_STORAGE_TYPE",
        "SPOKE_FILESYSTEM_ROOT",
        "SPOKE_CACHE_ENABLED",
        "SPOKE_CACHE_TTL_LATEST_SECS",
        "SPOKE_DATABASE_REPLICA_URLS",
    ] {
        std::env::remove_var(key);
    }
}
