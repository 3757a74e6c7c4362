//! SyncEngine: Mirrors local changes onto the remote root.
//!
//! The engine runs in two phases from a single consumer loop:
//!
//! 1. Initial sync: walk the local root depth-first and push every regular,
//!    non-hidden file (skipped with `skip_initial_sync`)
//! 2. Steady state: apply watch events in arrival order until shutdown
//!
//! Create/Write push the file, Remove deletes the mapped remote path, Rename
//! deletes the old remote path and then pushes the new one. A failure on one
//! file is logged and never stops the loop.

use crate::events::{WatchEvent, WatchEventKind};
use crate::paths::{remote_parent, PathError, SyncRoot};
use crate::scp::{self, TransferError};
use crate::transport::{RemoteTransport, SessionRequest, TransportError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Underlying reason a single file could not be synced.
#[derive(Debug, Error)]
pub enum SyncCause {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote command `{command}` exited with status {status}")]
    Command { command: String, status: i32 },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A recoverable, per-file failure.
#[derive(Debug, Error)]
#[error("failed to sync {} -> {remote}: {cause}", .path.display())]
pub struct SyncError {
    pub path: PathBuf,
    pub remote: String,
    #[source]
    pub cause: SyncCause,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Permission bits sent with every pushed file
    pub file_mode: u32,
    pub skip_initial_sync: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            file_mode: 0o755,
            skip_initial_sync: false,
        }
    }
}

/// Counters for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub synced: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct SyncEngine {
    transport: Arc<dyn RemoteTransport>,
    root: SyncRoot,
    options: EngineOptions,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn RemoteTransport>, root: SyncRoot, options: EngineOptions) -> Self {
        Self {
            transport,
            root,
            options,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Remote path for a local path.
    pub fn remote_path(&self, local: &Path) -> Result<String, PathError> {
        self.root.remote_path(local)
    }

    /// Run both phases until the event stream ends or shutdown is signalled.
    pub async fn run(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncStats {
        if self.options.skip_initial_sync {
            info!("Skipping initial sync");
        } else {
            self.initial_sync(&mut shutdown).await;
        }

        loop {
            tokio::select! {
                biased;

                // The watch::Ref must not outlive the arm, or the loop future is !Send
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    debug!("Sync loop stopping on shutdown");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => {
                        info!("{:<6} :: {}", event.label(), event.path().display());
                        if let Err(e) = self.apply(&event).await {
                            error!("{}", e);
                        }
                    }
                    None => {
                        debug!("Watch stream ended");
                        break;
                    }
                },
            }
        }

        self.stats
    }

    /// Phase 1: push every regular, non-hidden file under the local root.
    pub async fn initial_sync(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let root = self.root.clone();
        let files = match tokio::task::spawn_blocking(move || root.walk_files(root.local())).await {
            Ok(files) => files,
            Err(e) => {
                error!("Initial walk of {} failed: {}", self.root.local().display(), e);
                return;
            }
        };

        info!("Initial sync: {} file(s) under {}", files.len(), self.root.local().display());
        for file in files {
            if *shutdown.borrow() {
                warn!("Initial sync interrupted");
                return;
            }
            if let Err(e) = self.apply(&WatchEvent::create(file)).await {
                error!("{}", e);
            }
        }
        info!(
            "Initial sync complete: {} synced, {} failed",
            self.stats.synced, self.stats.failed
        );
    }

    /// Apply a single event, updating the run counters.
    pub async fn apply(&mut self, event: &WatchEvent) -> Result<(), SyncError> {
        let result = match &event.kind {
            WatchEventKind::Create | WatchEventKind::Write => self.sync_file(&event.path).await,
            WatchEventKind::Remove => self.remove(&event.path).await,
            WatchEventKind::Rename { from } => {
                let removed = self.remove(from).await;
                self.sync_file(&event.path).await.and(removed)
            }
        };
        if result.is_err() {
            self.stats.failed += 1;
        }
        result
    }

    /// Push one local file to its mapped remote path.
    pub async fn sync_file(&mut self, local: &Path) -> Result<(), SyncError> {
        let remote = self.map(local)?;
        let fail = |cause: SyncCause| SyncError {
            path: local.to_path_buf(),
            remote: remote.clone(),
            cause,
        };

        let file = match tokio::fs::File::open(local).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} vanished before it could be pushed", local.display());
                return Ok(());
            }
            Err(e) => return Err(fail(e.into())),
        };
        let metadata = file.metadata().await.map_err(|e| fail(e.into()))?;
        if !metadata.is_file() {
            debug!("Not pushing non-regular file {}", local.display());
            return Ok(());
        }

        self.ensure_remote_dir(remote_parent(&remote))
            .await
            .map_err(&fail)?;

        let size = metadata.len();
        scp::push(
            self.transport.as_ref(),
            file.take(size),
            size,
            self.options.file_mode,
            &remote,
        )
        .await
        .map_err(|e| fail(e.into()))?;

        info!("Synced {} --> {}", local.display(), remote);
        self.stats.synced += 1;
        Ok(())
    }

    /// Delete the mapped remote path (file or directory).
    pub async fn remove(&mut self, local: &Path) -> Result<(), SyncError> {
        let remote = self.map(local)?;
        let command = format!("rm -rf {}", shell_words::quote(&remote));
        self.run_command(command).await.map_err(|cause| SyncError {
            path: local.to_path_buf(),
            remote: remote.clone(),
            cause,
        })?;

        info!("Removed {}", remote);
        self.stats.removed += 1;
        Ok(())
    }

    /// `mkdir -p` on the remote side; safe to repeat.
    pub async fn ensure_remote_dir(&self, dir: &str) -> Result<(), SyncCause> {
        self.run_command(format!("mkdir -p {}", shell_words::quote(dir)))
            .await
    }

    fn map(&self, local: &Path) -> Result<String, SyncError> {
        self.root.remote_path(local).map_err(|e| SyncError {
            path: local.to_path_buf(),
            remote: String::from("<unmapped>"),
            cause: e.into(),
        })
    }

    /// One-shot remote command; only the exit status matters.
    async fn run_command(&self, command: String) -> Result<(), SyncCause> {
        let mut session = self
            .transport
            .open_session(SessionRequest::Exec(command.clone()))
            .await?;
        drop(session.take_stdin());

        let mut stdout = session.take_stdout();
        let mut stderr = session.take_stderr();
        let mut discard = Vec::new();
        let mut diagnostics = String::new();
        let (_, _) = tokio::join!(
            async {
                if let Some(out) = stdout.as_mut() {
                    let _ = out.read_to_end(&mut discard).await;
                }
            },
            async {
                if let Some(err) = stderr.as_mut() {
                    let _ = err.read_to_string(&mut diagnostics).await;
                }
            }
        );

        let status = session.wait().await?;
        if status != 0 {
            debug!("`{}` failed: {}", command, diagnostics.trim());
            return Err(SyncCause::Command { command, status });
        }
        Ok(())
    }
}
