//! Canonical local filesystem events consumed by the sync engine.

use std::path::{Path, PathBuf};

/// Kind of local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    /// A file appeared
    Create,
    /// A file's contents changed
    Write,
    /// A file (or directory) went away
    Remove,
    /// A file moved from `from` to the event's path
    Rename { from: PathBuf },
}

/// A single change under the local root, identified by absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Create,
            path: path.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Write,
            path: path.into(),
        }
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Remove,
            path: path.into(),
        }
    }

    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Rename { from: from.into() },
            path: to.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short label used in status lines.
    pub fn label(&self) -> &'static str {
        match self.kind {
            WatchEventKind::Create => "create",
            WatchEventKind::Write => "write",
            WatchEventKind::Remove => "remove",
            WatchEventKind::Rename { .. } => "rename",
        }
    }
}
