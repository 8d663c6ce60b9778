//! The path gate: decides whether an absolute pathname lies beneath the
//! configured session root, and owns the root itself as read-mostly state.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};

/// Compile-time default session root (spec: §6 "Default `/mnt`").
pub const DEFAULT_ROOT: &str = "/mnt";

/// Outcome of [`PathGate::is_under_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// The path lies under the configured root.
    Inside,
    /// The path does not lie under the configured root.
    Outside,
}

/// Read-mostly holder of the session root, guarded by a single-writer,
/// many-reader lock.
#[derive(Debug)]
pub struct PathGate {
    root: RwLock<PathBuf>,
}

impl PathGate {
    /// Build a gate rooted at the compile-time default (`/mnt`).
    pub fn new() -> Self {
        PathGate {
            root: RwLock::new(PathBuf::from(DEFAULT_ROOT)),
        }
    }

    /// Build a gate rooted at `root`. Fails with [`CoreError::Invalid`] if
    /// `root` is not absolute.
    pub fn with_root(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(CoreError::Invalid);
        }
        Ok(PathGate {
            root: RwLock::new(root),
        })
    }

    /// Read the current session root under the read side of the root lock.
    pub fn get_root(&self) -> PathBuf {
        self.root.read().clone()
    }

    /// Replace the session root atomically under the write side of the
    /// root lock. Fails with [`CoreError::Invalid`] (no mutation) if `path`
    /// is not absolute.
    pub fn set_root(&self, path: impl Into<PathBuf>) -> CoreResult<()> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(CoreError::Invalid);
        }
        *self.root.write() = path;
        Ok(())
    }

    /// Decide whether `path` lies under the currently configured root.
    ///
    /// Membership is advisory: only creators of new incarnations depend on
    /// it, and a spoofed path still fails later at actual file creation. If
    /// `path` resolves to an existing entity, ancestry is checked by
    /// walking its canonicalized parents against the canonicalized root.
    /// If it does not resolve (e.g. a file about to be created), the check
    /// falls back to a normalized string prefix comparison.
    pub fn is_under_root(&self, path: &Path) -> Membership {
        let root = self.root.read().clone();
        if let (Ok(canonical_root), Ok(canonical_path)) = (root.canonicalize(), path.canonicalize())
        {
            return if canonical_path.starts_with(&canonical_root) {
                Membership::Inside
            } else {
                Membership::Outside
            };
        }
        let normalized_root = normalize(&root);
        let normalized_path = normalize(path);
        if normalized_path.starts_with(&normalized_root) {
            Membership::Inside
        } else {
            Membership::Outside
        }
    }
}

impl Default for PathGate {
    fn default() -> Self {
        PathGate::new()
    }
}

/// Collapse `.`/`..`/repeated separators without touching the filesystem,
/// for the advisory prefix check used when a path does not yet resolve.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
