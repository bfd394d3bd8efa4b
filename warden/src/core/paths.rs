//! Lexical path handling for the tool policy.
//!
//! Everything here works on path components only; symlink resolution is the
//! caller's job.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `base` (if relative) and normalize `.`/`..` lexically.
///
/// `..` never climbs above the filesystem root.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// True if `path` equals `prefix` or lies underneath it (component-wise).
pub fn is_within(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

/// The fixed set of files the agent must never modify.
///
/// Built once at startup; there are no methods that add or remove entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPaths {
    paths: Vec<PathBuf>,
}

impl ProtectedPaths {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut paths: Vec<PathBuf> = paths.into_iter().map(|p| normalize(p.as_ref())).collect();
        paths.sort();
        paths.dedup();
        Self { paths }
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.paths.iter().any(|p| *p == path)
    }

    /// True if `text` mentions any protected path, by full path or file name.
    pub fn mentioned_in(&self, text: &str) -> Option<&Path> {
        self.paths.iter().map(PathBuf::as_path).find(|p| {
            text.contains(&*p.to_string_lossy())
                || p.file_name()
                    .map(|name| text.contains(&*name.to_string_lossy()))
                    .unwrap_or(false)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
