//! Sync root pair and lexical path mapping.
//!
//! Every local path the engine touches is re-based from the local root onto
//! the remote root. Mapping is purely lexical: symlinks under the root are
//! never resolved, so the same local path always maps to the same remote path.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is outside the sync root: {0}")]
    OutsideRoot(PathBuf),

    #[error("path is the sync root itself: {0}")]
    IsRoot(PathBuf),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(PathBuf),
}

/// The (local, remote) directory correspondence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoot {
    local: PathBuf,
    remote: String,
}

impl SyncRoot {
    /// Create a root pair. `local` should already be absolute; a trailing
    /// slash on `remote` is dropped (except for `/` itself).
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        let mut remote = remote.into();
        while remote.len() > 1 && remote.ends_with('/') {
            remote.pop();
        }
        Self {
            local: local.into(),
            remote,
        }
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Path of `local` relative to the local root, as `/`-joined components.
    pub fn relative(&self, local: &Path) -> Result<String, PathError> {
        let rest = local
            .strip_prefix(&self.local)
            .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;

        let mut parts = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(name) => parts.push(
                    name.to_str()
                        .ok_or_else(|| PathError::NonUtf8(local.to_path_buf()))?,
                ),
                Component::CurDir => {}
                _ => return Err(PathError::OutsideRoot(local.to_path_buf())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Remote path for a local path under the root.
    pub fn remote_path(&self, local: &Path) -> Result<String, PathError> {
        let relative = self.relative(local)?;
        if relative.is_empty() {
            return Err(PathError::IsRoot(local.to_path_buf()));
        }
        if self.remote.ends_with('/') {
            Ok(format!("{}{}", self.remote, relative))
        } else {
            Ok(format!("{}/{}", self.remote, relative))
        }
    }

    /// True if any component below the root starts with a dot.
    pub fn is_hidden(&self, local: &Path) -> bool {
        match local.strip_prefix(&self.local) {
            Ok(rest) => rest.components().any(|c| match c {
                Component::Normal(name) => is_hidden_name(name),
                _ => false,
            }),
            Err(_) => false,
        }
    }

    /// Regular, non-hidden files under `dir` in depth-first, name-sorted order.
    ///
    /// Hidden directories are pruned, not descended into. Unreadable entries
    /// are logged and skipped.
    pub fn walk_files(&self, dir: &Path) -> Vec<PathBuf> {
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden_name(entry.file_name()));

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if !self.is_hidden(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable entry while walking {}: {}", dir.display(), e),
            }
        }
        files
    }
}

/// Parent directory of a remote path (`/` for top-level entries).
pub fn remote_parent(remote: &str) -> &str {
    match remote.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Final component of a remote path.
pub fn remote_file_name(remote: &str) -> &str {
    remote.rsplit_once('/').map(|(_, name)| name).unwrap_or(remote)
}

fn is_hidden_name(name: &OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}
