//! Entity types for the schema registry storage core.
//!
//! Responsibilities:
//! - Define the Module / ModuleVersion / VersionFile / VersionDependency
//!   records exchanged through the storage facade.
//! - Enforce the identifier grammar for module names, version tags and
//!   file paths before anything reaches a backend.
//! - Encode file content for the interchange boundary: UTF-8 for text
//!   subtypes, base64 for everything else.
//!
//! Timestamps are UTC and serialize as RFC 3339 through chrono's serde
//! support. Entities are plain serde records so every backend (filesystem
//! JSON manifests, relational rows, cache payloads) shares one encoding.

use crate::errors::StorageError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Maximum byte length of a module name.
pub const MAX_MODULE_NAME_LEN: usize = 128;
/// Maximum byte length of a version tag.
pub const MAX_VERSION_LEN: usize = 128;
/// Maximum byte length of a file path within a version.
pub const MAX_FILE_PATH_LEN: usize = 512;

/// A named, mutable namespace containing an ordered history of versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input record for `CreateModule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModule {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl NewModule {
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_module_name(&self.name)
    }
}

/// Mutable module metadata for `UpdateModule`. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.description.is_none()
    }
}

/// Lifecycle state of a version. Transitions are strictly forward;
/// a version never returns to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Draft,
    Published,
    Deprecated,
    Archived,
}

impl Default for VersionState {
    fn default() -> Self {
        VersionState::Published
    }
}

impl VersionState {
    fn rank(self) -> u8 {
        match self {
            VersionState::Draft => 0,
            VersionState::Published => 1,
            VersionState::Deprecated => 2,
            VersionState::Archived => 3,
        }
    }

    /// Forward-only transition rule. Skipping states is allowed, going
    /// back or standing still is not.
    pub fn can_transition_to(self, next: VersionState) -> bool {
        next.rank() > self.rank()
    }

    /// Whether the file set of a version in this state is frozen.
    pub fn is_frozen(self) -> bool {
        self.rank() >= VersionState::Published.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionState::Draft => "draft",
            VersionState::Published => "published",
            VersionState::Deprecated => "deprecated",
            VersionState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<VersionState> {
        match s {
            "draft" => Some(VersionState::Draft),
            "published" => Some(VersionState::Published),
            "deprecated" => Some(VersionState::Deprecated),
            "archived" => Some(VersionState::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, tagged snapshot of a module's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub state: VersionState,
    #[serde(default)]
    pub files: Vec<VersionFile>,
    #[serde(default)]
    pub dependencies: Vec<VersionDependency>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleVersion {
    /// Copy without file and dependency payloads, for listings.
    pub fn summary(&self) -> ModuleVersion {
        ModuleVersion {
            module_name: self.module_name.clone(),
            version: self.version.clone(),
            state: self.state,
            files: Vec::new(),
            dependencies: Vec::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A path + content pair belonging to one version. `content` is attached
/// lazily; listings and version manifests carry metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionFile {
    pub path: String,
    pub content_hash: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
}

/// A declared dependency of a version on another module's version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDependency {
    pub module_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<String>,
}

/// One node of a resolved dependency tree: a version plus the fully
/// resolved trees of its declared dependencies. Versions are immutable,
/// so a tree is stable once its root version exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub module_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyNode>,
}

/// Input record for `CreateVersion`. File hashes and sizes are computed
/// by the backend; callers provide paths and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVersion {
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub state: VersionState,
    pub files: Vec<NewVersionFile>,
    #[serde(default)]
    pub dependencies: Vec<VersionDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVersionFile {
    pub path: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub content: FileContent,
}

impl NewVersion {
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_module_name(&self.module_name)?;
        validate_version_tag(&self.version)?;
        if self.files.is_empty() {
            return Err(StorageError::InvalidArgument(
                "a version must contain at least one file".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for file in &self.files {
            validate_file_path(&file.path)?;
            if !seen.insert(file.path.as_str()) {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate file path: {}",
                    file.path
                )));
            }
        }
        let mut dep_seen = HashSet::new();
        for dep in &self.dependencies {
            validate_module_name(&dep.module_name)?;
            validate_version_tag(&dep.version)?;
            if !dep_seen.insert((dep.module_name.as_str(), dep.import_path.as_deref())) {
                return Err(StorageError::InvalidArgument(format!(
                    "duplicate dependency on module {}",
                    dep.module_name
                )));
            }
        }
        Ok(())
    }
}

/// Mutable version fields for `UpdateVersion`. The file set is never
/// touched here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionUpdate {
    #[serde(default)]
    pub state: Option<VersionState>,
}

/// File content at the interchange boundary. Text subtypes travel as
/// UTF-8, everything else as base64. The stores themselves always hold
/// raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum FileContent {
    Utf8(String),
    Base64(String),
}

impl FileContent {
    /// Choose the encoding from the content type, falling back to base64
    /// when the bytes are not valid UTF-8 regardless of the declared type.
    pub fn from_bytes(content_type: &str, bytes: &[u8]) -> Self {
        if is_text_content_type(content_type) {
            if let Ok(text) = std::str::from_utf8(bytes) {
                return FileContent::Utf8(text.to_string());
            }
        }
        FileContent::Base64(BASE64.encode(bytes))
    }

    pub fn to_bytes(&self) -> Result<Bytes, StorageError> {
        match self {
            FileContent::Utf8(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            FileContent::Base64(data) => BASE64
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| StorageError::InvalidArgument(format!("malformed base64 content: {}", e))),
        }
    }
}

/// Whether a content type is exchanged as UTF-8 text.
pub fn is_text_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/x-protobuf"
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// Page selector for the paginated listings. Limits are clamped so a
/// single request cannot sweep the whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u64,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: u32, offset: u64) -> Self {
        Self { limit, offset }.normalized()
    }

    pub fn normalized(self) -> Self {
        let limit = if self.limit == 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        };
        Self {
            limit,
            offset: self.offset,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One page of results plus the total count under the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

/// Module names are lowercase identifiers: `[a-z0-9]` with interior
/// `.`, `_` or `-` separators, never at the edges.
pub fn validate_module_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidArgument(
            "module name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_MODULE_NAME_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "module name exceeds {} bytes",
            MAX_MODULE_NAME_LEN
        )));
    }
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(StorageError::InvalidArgument(format!(
            "module name must start and end with a lowercase letter or digit: {}",
            name
        )));
    }
    for &b in bytes {
        if !(edge_ok(b) || b == b'.' || b == b'_' || b == b'-') {
            return Err(StorageError::InvalidArgument(format!(
                "module name contains invalid character {:?}: {}",
                b as char, name
            )));
        }
    }
    Ok(())
}

/// Version tags are free-form-ish (typically semver): alphanumeric with
/// `.`, `+`, `_`, `-` separators, no slashes.
pub fn validate_version_tag(version: &str) -> Result<(), StorageError> {
    if version.is_empty() {
        return Err(StorageError::InvalidArgument(
            "version must not be empty".to_string(),
        ));
    }
    if version.len() > MAX_VERSION_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "version exceeds {} bytes",
            MAX_VERSION_LEN
        )));
    }
    if !version.as_bytes()[0].is_ascii_alphanumeric() {
        return Err(StorageError::InvalidArgument(format!(
            "version must start with a letter or digit: {}",
            version
        )));
    }
    for &b in version.as_bytes() {
        if !(b.is_ascii_alphanumeric() || b == b'.' || b == b'+' || b == b'_' || b == b'-') {
            return Err(StorageError::InvalidArgument(format!(
                "version contains invalid character {:?}: {}",
                b as char, version
            )));
        }
    }
    Ok(())
}

/// File paths are relative POSIX paths: no leading `/`, no `.` or `..`
/// segments, no empty segments, no segment starting with a dot (dot
/// entries are reserved for driver-internal directories).
pub fn validate_file_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidArgument(
            "file path must not be empty".to_string(),
        ));
    }
    if path.len() > MAX_FILE_PATH_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "file path exceeds {} bytes",
            MAX_FILE_PATH_LEN
        )));
    }
    if path.starts_with('/') {
        return Err(StorageError::InvalidArgument(format!(
            "file path must be relative: {}",
            path
        )));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(StorageError::InvalidArgument(format!(
            "file path contains forbidden characters: {}",
            path
        )));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "file path contains an empty segment: {}",
                path
            )));
        }
        if segment.starts_with('.') {
            return Err(StorageError::InvalidArgument(format!(
                "file path segments must not start with a dot: {}",
                path
            )));
        }
    }
    Ok(())
}
