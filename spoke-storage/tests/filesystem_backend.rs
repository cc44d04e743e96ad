//! End-to-end scenarios against the filesystem driver.

use bytes::Bytes;
use spoke_storage::object_store::content_hash;
use spoke_storage::observability::StorageMetrics;
use spoke_storage::storage_backends::FilesystemBackend;
use spoke_storage::{
    ArtifactStorage, FileContent, FileStorage, HealthChecker, HealthStatus, ModuleReader,
    ModuleUpdate, ModuleWriter, NewModule, NewVersion, NewVersionFile, OpContext, PageRequest,
    Storage, StorageError, VersionReader, VersionState, VersionUpdate, VersionWriter,
};
use std::sync::Arc;
use std::time::Duration;

const PROTO: &str = "syntax=\"proto3\";";

fn backend(dir: &tempfile::TempDir) -> FilesystemBackend {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    FilesystemBackend::open(dir.path(), Arc::new(StorageMetrics::new())).expect("open backend")
}

fn new_module(name: &str) -> NewModule {
    NewModule {
        name: name.to_string(),
        display_name: format!("Module {}", name),
        description: String::new(),
    }
}

fn proto_file(path: &str, content: &str) -> NewVersionFile {
    NewVersionFile {
        path: path.to_string(),
        content_type: "text/plain".to_string(),
        content: FileContent::Utf8(content.to_string()),
    }
}

fn new_version(module: &str, version: &str, files: Vec<NewVersionFile>) -> NewVersion {
    NewVersion {
        module_name: module.to_string(),
        version: version.to_string(),
        state: VersionState::Published,
        files,
        dependencies: vec![],
    }
}

#[tokio::test]
async fn test_create_and_fetch_module() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    let created = storage
        .create_module(
            &ctx,
            NewModule {
                name: "acme".to_string(),
                display_name: "Acme".to_string(),
                description: "Schemas for acme".to_string(),
            },
        )
        .await
        .expect("create module");
    assert_eq!(created.name, "acme");
    assert_eq!(created.display_name, "Acme");

    let fetched = storage.get_module(&ctx, "acme").await.expect("get module");
    assert_eq!(fetched.name, "acme");
    assert_eq!(fetched.display_name, "Acme");
    assert_eq!(fetched.created_at, created.created_at);
    assert!(fetched.created_at.timestamp() > 0);

    // A second create with the same name conflicts; the stored record is
    // the first one.
    let second = storage.create_module(&ctx, new_module("acme")).await;
    assert!(matches!(second, Err(StorageError::AlreadyExists(_))));
    let still = storage.get_module(&ctx, "acme").await.unwrap();
    assert_eq!(still.display_name, "Acme");
}

#[tokio::test]
async fn test_malformed_module_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    let result = storage.create_module(&ctx, new_module("Not Valid")).await;
    assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
    let result = storage.get_module(&ctx, "nope").await;
    assert!(matches!(result, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_create_version_with_two_files_dedups_content() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    let created = storage
        .create_version(
            &ctx,
            new_version(
                "acme",
                "v1.0.0",
                vec![proto_file("a.proto", PROTO), proto_file("b.proto", PROTO)],
            ),
        )
        .await
        .expect("create version");
    assert_eq!(created.files.len(), 2);

    let file = storage
        .get_file(&ctx, "acme", "v1.0.0", "a.proto")
        .await
        .expect("get file");
    assert_eq!(file.content, Some(FileContent::Utf8(PROTO.to_string())));
    assert_eq!(file.content_hash, content_hash(PROTO.as_bytes()));
    assert_eq!(file.size, PROTO.len() as u64);

    // Identical content shares one blob key.
    let other = storage
        .get_file(&ctx, "acme", "v1.0.0", "b.proto")
        .await
        .unwrap();
    assert_eq!(other.content_hash, file.content_hash);

    // And the blob is retrievable by its hash.
    let blob = storage
        .get_file_content(&ctx, &file.content_hash)
        .await
        .expect("get content");
    assert_eq!(blob.as_ref(), PROTO.as_bytes());
}

#[tokio::test]
async fn test_duplicate_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    storage
        .create_version(&ctx, new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]))
        .await
        .unwrap();
    let again = storage
        .create_version(&ctx, new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]))
        .await;
    assert!(matches!(again, Err(StorageError::AlreadyExists(_))));
}

#[tokio::test]
async fn test_create_version_requires_module_and_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    let missing_module = storage
        .create_version(&ctx, new_version("ghost", "v1", vec![proto_file("a.proto", PROTO)]))
        .await;
    assert!(matches!(missing_module, Err(StorageError::NotFound(_))));

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    let mut version = new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]);
    version.dependencies = vec![spoke_storage::VersionDependency {
        module_name: "missing".to_string(),
        version: "v9".to_string(),
        import_path: None,
    }];
    let unresolvable = storage.create_version(&ctx, version).await;
    assert!(matches!(unresolvable, Err(StorageError::Precondition(_))));
}

#[tokio::test]
async fn test_pagination_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    for i in 1..=25 {
        storage
            .create_module(&ctx, new_module(&format!("m{:02}", i)))
            .await
            .unwrap();
    }

    let first = storage
        .list_modules_paginated(&ctx, PageRequest::new(10, 0))
        .await
        .unwrap();
    assert_eq!(first.total, 25);
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.items[0].name, "m01");
    assert_eq!(first.items[9].name, "m10");

    let tail = storage
        .list_modules_paginated(&ctx, PageRequest::new(10, 20))
        .await
        .unwrap();
    assert_eq!(tail.total, 25);
    let names: Vec<&str> = tail.items.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["m21", "m22", "m23", "m24", "m25"]);
}

#[tokio::test]
async fn test_list_versions_sees_new_version_after_write() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    storage
        .create_version(&ctx, new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]))
        .await
        .unwrap();
    let before = storage.list_versions(&ctx, "acme").await.unwrap();
    assert_eq!(before.len(), 1);

    storage
        .create_version(&ctx, new_version("acme", "v2", vec![proto_file("a.proto", PROTO)]))
        .await
        .unwrap();
    let after = storage.list_versions(&ctx, "acme").await.unwrap();
    assert!(after.iter().any(|v| v.version == "v2"));

    let latest = storage.latest_version(&ctx, "acme").await.unwrap();
    assert_eq!(latest.version, "v2");
}

#[tokio::test]
async fn test_version_state_transitions_are_forward_only() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    storage
        .create_version(&ctx, new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]))
        .await
        .unwrap();

    let deprecated = storage
        .update_version(
            &ctx,
            "acme",
            "v1",
            VersionUpdate {
                state: Some(VersionState::Deprecated),
            },
        )
        .await
        .expect("deprecate");
    assert_eq!(deprecated.state, VersionState::Deprecated);

    let backwards = storage
        .update_version(
            &ctx,
            "acme",
            "v1",
            VersionUpdate {
                state: Some(VersionState::Published),
            },
        )
        .await;
    assert!(matches!(backwards, Err(StorageError::Precondition(_))));
}

#[tokio::test]
async fn test_update_module_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    let updated = storage
        .update_module(
            &ctx,
            "acme",
            ModuleUpdate {
                display_name: Some("Acme Corp".to_string()),
                description: None,
            },
        )
        .await
        .expect("update module");
    assert_eq!(updated.display_name, "Acme Corp");
    assert!(updated.updated_at >= updated.created_at);
}

#[tokio::test]
async fn test_put_get_file_content_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    let payload = b"message Thing { int64 id = 1; }".to_vec();
    let mut reader = std::io::Cursor::new(payload.clone());
    let hash = storage
        .put_file_content(&ctx, &mut reader, "text/plain")
        .await
        .expect("put content");
    assert_eq!(hash, content_hash(&payload));

    let fetched = storage.get_file_content(&ctx, &hash).await.unwrap();
    assert_eq!(fetched.as_ref(), payload.as_slice());

    // Same bytes, same hash; different bytes, different hash.
    let mut reader = std::io::Cursor::new(payload.clone());
    let same = storage
        .put_file_content(&ctx, &mut reader, "text/plain")
        .await
        .unwrap();
    assert_eq!(same, hash);
    let mut reader = std::io::Cursor::new(b"other".to_vec());
    let different = storage
        .put_file_content(&ctx, &mut reader, "text/plain")
        .await
        .unwrap();
    assert_ne!(different, hash);
}

#[tokio::test]
async fn test_compiled_artifact_roundtrip_and_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    storage
        .create_version(&ctx, new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]))
        .await
        .unwrap();

    let missing = storage.get_compiled_artifact(&ctx, "acme", "v1", "go").await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));

    storage
        .put_compiled_artifact(&ctx, "acme", "v1", "go", Bytes::from_static(b"gen1"))
        .await
        .expect("put artifact");
    let artifact = storage
        .get_compiled_artifact(&ctx, "acme", "v1", "go")
        .await
        .unwrap();
    assert_eq!(artifact.as_ref(), b"gen1");

    // Writing again replaces atomically.
    storage
        .put_compiled_artifact(&ctx, "acme", "v1", "go", Bytes::from_static(b"gen2"))
        .await
        .unwrap();
    let artifact = storage
        .get_compiled_artifact(&ctx, "acme", "v1", "go")
        .await
        .unwrap();
    assert_eq!(artifact.as_ref(), b"gen2");

    // Artifacts for an unknown version are rejected.
    let orphan = storage
        .put_compiled_artifact(&ctx, "acme", "v9", "go", Bytes::from_static(b"gen"))
        .await;
    assert!(matches!(orphan, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_dependency_tree_resolves_transitively() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    for name in ["base", "lib", "app"] {
        storage.create_module(&ctx, new_module(name)).await.unwrap();
    }
    storage
        .create_version(&ctx, new_version("base", "v1", vec![proto_file("base.proto", PROTO)]))
        .await
        .unwrap();

    let mut lib = new_version("lib", "v1", vec![proto_file("lib.proto", PROTO)]);
    lib.dependencies = vec![spoke_storage::VersionDependency {
        module_name: "base".to_string(),
        version: "v1".to_string(),
        import_path: Some("base.proto".to_string()),
    }];
    storage.create_version(&ctx, lib).await.unwrap();

    let mut app = new_version("app", "v1", vec![proto_file("app.proto", PROTO)]);
    app.dependencies = vec![spoke_storage::VersionDependency {
        module_name: "lib".to_string(),
        version: "v1".to_string(),
        import_path: Some("lib.proto".to_string()),
    }];
    storage.create_version(&ctx, app).await.unwrap();

    let tree = storage
        .dependency_tree(&ctx, "app", "v1")
        .await
        .expect("resolve tree");
    assert_eq!(tree.module_name, "app");
    assert_eq!(tree.dependencies.len(), 1);
    let lib_node = &tree.dependencies[0];
    assert_eq!(lib_node.module_name, "lib");
    assert_eq!(lib_node.import_path.as_deref(), Some("lib.proto"));
    assert_eq!(lib_node.dependencies.len(), 1);
    assert_eq!(lib_node.dependencies[0].module_name, "base");

    let missing = storage.dependency_tree(&ctx, "app", "v9").await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
}

#[tokio::test]
async fn test_health_check_reports_writable_root() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    let report = storage.health_check(&ctx).await.expect("health");
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.checks[0].name, "filesystem");
}

#[tokio::test]
async fn test_expired_deadline_surfaces_before_io() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);

    storage
        .create_module(&OpContext::background(), new_module("acme"))
        .await
        .unwrap();

    let ctx = OpContext::background().with_deadline(Duration::ZERO);
    let result = storage.get_version(&ctx, "acme", "v1").await;
    assert!(matches!(result, Err(StorageError::DeadlineExceeded)));
}

#[tokio::test]
async fn test_closed_backend_rejects_new_operations() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    storage.close(Duration::from_millis(100)).await.unwrap();

    let result = storage.get_module(&ctx, "acme").await;
    assert!(matches!(result, Err(StorageError::Canceled)));
}

#[tokio::test]
async fn test_failed_create_version_leaves_no_partial_version() {
    let dir = tempfile::tempdir().unwrap();
    let storage = backend(&dir);
    let ctx = OpContext::background();

    storage.create_module(&ctx, new_module("acme")).await.unwrap();
    let mut version = new_version("acme", "v1", vec![proto_file("a.proto", PROTO)]);
    version.files.push(NewVersionFile {
        path: "bad.bin".to_string(),
        content_type: "application/octet-stream".to_string(),
        content: FileContent::Base64("not!base64!!".to_string()),
    });
    let result = storage.create_version(&ctx, version).await;
    assert!(matches!(result, Err(StorageError::InvalidArgument(_))));

    // The torn write was cleaned up; the version does not exist.
    let missing = storage.get_version(&ctx, "acme", "v1").await;
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
    assert!(storage.list_versions(&ctx, "acme").await.unwrap().is_empty());
}
