//! Cache key families, TTL policy and glob matching.
//!
//! Keys are flat strings with a family prefix (`module:<name>`,
//! `version:<module>:<version>`). Invalidation patterns use `*` as a
//! wildcard; the facade computes the pattern set from the entity being
//! mutated, so patterns stay simple (`version:acme:*`).

use crate::config::CacheTtlConfig;
use std::time::Duration;

/// The enumerated key families. Additions require configuration (a TTL),
/// not new code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Module,
    Version,
    VersionFull,
    VersionList,
    Latest,
    Compiled,
    ProtoContent,
    DependencyTree,
}

impl KeyFamily {
    pub fn label(self) -> &'static str {
        match self {
            KeyFamily::Module => "module",
            KeyFamily::Version => "version",
            KeyFamily::VersionFull => "version_full",
            KeyFamily::VersionList => "version_list",
            KeyFamily::Latest => "latest",
            KeyFamily::Compiled => "compiled",
            KeyFamily::ProtoContent => "proto_content",
            KeyFamily::DependencyTree => "dependency_tree",
        }
    }

    /// Configured TTL for entries of this family.
    pub fn ttl(self, config: &CacheTtlConfig) -> Duration {
        let secs = match self {
            KeyFamily::Module => config.module_secs,
            KeyFamily::Version => config.version_secs,
            KeyFamily::VersionFull => config.version_full_secs,
            KeyFamily::VersionList => config.version_list_secs,
            KeyFamily::Latest => config.latest_secs,
            KeyFamily::Compiled => config.compiled_secs,
            KeyFamily::ProtoContent => config.proto_content_secs,
            KeyFamily::DependencyTree => config.dependency_tree_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Family of an existing key or pattern, derived from its prefix.
pub fn family_of(key: &str) -> Option<KeyFamily> {
    let prefix = key.split(':').next()?;
    match prefix {
        "module" => Some(KeyFamily::Module),
        "version" => Some(KeyFamily::Version),
        "version_full" => Some(KeyFamily::VersionFull),
        "version_list" => Some(KeyFamily::VersionList),
        "latest" => Some(KeyFamily::Latest),
        "compiled" => Some(KeyFamily::Compiled),
        "proto_content" => Some(KeyFamily::ProtoContent),
        "dependency_tree" => Some(KeyFamily::DependencyTree),
        _ => None,
    }
}

/// Label for metrics, tolerating unknown prefixes.
pub fn family_label(key: &str) -> &'static str {
    family_of(key).map(KeyFamily::label).unwrap_or("other")
}

pub fn module_key(name: &str) -> String {
    format!("module:{}", name)
}

pub fn version_key(module: &str, version: &str) -> String {
    format!("version:{}:{}", module, version)
}

pub fn version_full_key(module: &str, version: &str) -> String {
    format!("version_full:{}:{}", module, version)
}

pub fn version_list_key(module: &str) -> String {
    format!("version_list:{}", module)
}

pub fn latest_key(module: &str) -> String {
    format!("latest:{}", module)
}

pub fn compiled_key(module: &str, version: &str, language: &str) -> String {
    format!("compiled:{}:{}:{}", module, version, language)
}

pub fn proto_content_key(hash: &str) -> String {
    format!("proto_content:{}", hash)
}

pub fn dependency_tree_key(module: &str, version: &str) -> String {
    format!("dependency_tree:{}:{}", module, version)
}

/// Glob-style matching with `*` wildcards. A `*` matches any run of
/// characters, including none and including separators.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = key.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut matched = 0usize;

    while t < text.len() {
        if p < pat.len() && (pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            matched = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            matched += 1;
            t = matched;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
