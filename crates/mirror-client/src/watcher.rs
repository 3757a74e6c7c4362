//! Recursive directory watcher producing canonical watch events.
//!
//! Uses notify's recommended backend. Raw notify events are normalized into
//! `WatchEvent`s: hidden entries and directory-only events are dropped, and a
//! directory that appears inside the tree is expanded into one Create per
//! file already inside it.
//!
//! Renames are reported as a Remove of the old path followed by a Create of
//! the new one. Backends that do pair both halves (inotify's `Both`) are
//! ignored in favour of the halves, so every platform sees the same shape.

use mirror_core::{SyncRoot, WatchEvent};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Watcher over the local sync root.
pub struct DirWatcher {
    /// Watcher handle (must keep alive)
    _watcher: RecommendedWatcher,
    /// Receiver for normalized events
    event_rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl DirWatcher {
    /// Start watching the local root recursively.
    ///
    /// Events start queueing immediately, so anything that changes while the
    /// initial sync walks the tree is delivered afterwards.
    pub fn new(root: SyncRoot) -> Result<Self, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callback_root = root.clone();
        let watch_error = |source| WatchError::Watch {
            path: root.local().to_path_buf(),
            source,
        };

        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    for watch_event in translate(&event, &callback_root) {
                        debug!("Watch event: {:?}", watch_event);
                        if event_tx.send(watch_event).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )
        .map_err(watch_error)?;

        watcher
            .watch(root.local(), RecursiveMode::Recursive)
            .map_err(watch_error)?;

        Ok(Self {
            _watcher: watcher,
            event_rx,
        })
    }

    /// Get the receiver for watch events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<WatchEvent> {
        &mut self.event_rx
    }
}

/// Normalize one notify event.
pub fn translate(event: &notify::Event, root: &SyncRoot) -> Vec<WatchEvent> {
    let mut out = Vec::new();
    let paths = event.paths.iter().filter(|p| is_tracked(p, root));

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => {
            for path in paths {
                expand_dir(path, root, &mut out);
            }
        }
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in paths {
                appeared(path, root, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            out.extend(paths.map(WatchEvent::remove));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Unpaired rename: decide by whether the path is still there
            for path in paths {
                if path.exists() {
                    appeared(path, root, &mut out);
                } else {
                    out.push(WatchEvent::remove(path));
                }
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            out.extend(paths.filter(|p| p.is_file()).map(WatchEvent::write));
        }
        EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Remove(_) => {
            out.extend(paths.map(WatchEvent::remove));
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

fn is_tracked(path: &Path, root: &SyncRoot) -> bool {
    path != root.local() && path.starts_with(root.local()) && !root.is_hidden(path)
}

fn appeared(path: &Path, root: &SyncRoot, out: &mut Vec<WatchEvent>) {
    if path.is_dir() {
        expand_dir(path, root, out);
    } else {
        out.push(WatchEvent::create(path));
    }
}

/// One Create per file already inside a new directory.
fn expand_dir(dir: &Path, root: &SyncRoot, out: &mut Vec<WatchEvent>) {
    out.extend(root.walk_files(dir).into_iter().map(WatchEvent::create));
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::Event;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SyncRoot) {
        let dir = TempDir::new().unwrap();
        let local = dir.path().canonicalize().unwrap();
        (dir, SyncRoot::new(local, "/remote"))
    }

    #[test]
    fn test_create_and_write() {
        let (_dir, root) = setup();
        let file = root.local().join("a.txt");
        std::fs::write(&file, b"a").unwrap();

        let created = translate(
            &Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()),
            &root,
        );
        assert_eq!(created, vec![WatchEvent::create(&file)]);

        let written = translate(
            &Event::new(EventKind::Modify(ModifyKind::Any)).add_path(file.clone()),
            &root,
        );
        assert_eq!(written, vec![WatchEvent::write(&file)]);
    }

    #[test]
    fn test_hidden_paths_are_dropped() {
        let (_dir, root) = setup();
        let hidden = root.local().join(".git/index");
        std::fs::create_dir_all(hidden.parent().unwrap()).unwrap();
        std::fs::write(&hidden, b"x").unwrap();

        let events = translate(
            &Event::new(EventKind::Modify(ModifyKind::Any)).add_path(hidden),
            &root,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_directory_events_are_dropped() {
        let (_dir, root) = setup();
        let sub = root.local().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let modified = translate(
            &Event::new(EventKind::Modify(ModifyKind::Any)).add_path(sub.clone()),
            &root,
        );
        assert!(modified.is_empty());

        let removed = translate(
            &Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(sub),
            &root,
        );
        assert!(removed.is_empty());
    }

    #[test]
    fn test_new_directory_expands_to_files() {
        let (_dir, root) = setup();
        let sub = root.local().join("sub");
        std::fs::create_dir_all(sub.join("deep")).unwrap();
        std::fs::write(sub.join("one.txt"), b"1").unwrap();
        std::fs::write(sub.join("deep/two.txt"), b"2").unwrap();
        std::fs::write(sub.join(".skip"), b"s").unwrap();

        let events = translate(
            &Event::new(EventKind::Create(CreateKind::Folder)).add_path(sub.clone()),
            &root,
        );
        assert_eq!(
            events,
            vec![
                WatchEvent::create(sub.join("deep/two.txt")),
                WatchEvent::create(sub.join("one.txt")),
            ]
        );
    }

    #[test]
    fn test_rename_halves() {
        let (_dir, root) = setup();
        let old = root.local().join("old.txt");
        let new = root.local().join("new.txt");
        std::fs::write(&new, b"n").unwrap();

        let from = translate(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path(old.clone()),
            &root,
        );
        assert_eq!(from, vec![WatchEvent::remove(&old)]);

        let to = translate(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(new.clone()),
            &root,
        );
        assert_eq!(to, vec![WatchEvent::create(&new)]);

        let both = translate(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(old.clone())
                .add_path(new.clone()),
            &root,
        );
        assert!(both.is_empty());
    }

    #[test]
    fn test_unpaired_rename_checks_existence() {
        let (_dir, root) = setup();
        let gone = root.local().join("gone.txt");
        let here = root.local().join("here.txt");
        std::fs::write(&here, b"h").unwrap();

        let events = translate(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
                .add_path(gone.clone())
                .add_path(here.clone()),
            &root,
        );
        assert_eq!(events, vec![WatchEvent::remove(&gone), WatchEvent::create(&here)]);
    }

    #[test]
    fn test_paths_outside_root_are_dropped() {
        let (_dir, root) = setup();
        let events = translate(
            &Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/elsewhere/x")),
            &root,
        );
        assert!(events.is_empty());
    }
}
