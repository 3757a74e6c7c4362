//! sshmirror: Mirror a local directory onto a remote host over SSH.
//!
//! One authenticated connection carries both the sync engine's one-shot
//! sessions and an interactive login shell.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mirror_client::config::{resolve_remote_root, Args};
use mirror_client::shell::{terminal_size, RawModeGuard, RawModeWriter};
use mirror_client::{Config, DirWatcher, ShellSession, SshTransport};
use mirror_core::{RemoteTransport, SyncEngine, SyncRoot};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sshmirror=debug,mirror_client=debug,mirror_core=debug"
    } else {
        "info,sshmirror=info,mirror_client=info,mirror_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(|| RawModeWriter::new(std::io::stderr()))
        .init();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let config = Config::from_args(args)?;
    debug!("Configuration: {:?}", config);

    let transport = Arc::new(
        SshTransport::connect(config.ssh.clone())
            .await
            .with_context(|| format!("could not connect to {}", config.ssh.address))?,
    );

    let remote_root = match config.remote_dir.as_deref() {
        Some(dir) if dir.starts_with('/') => dir.to_string(),
        requested => {
            let home = transport.remote_home().await?;
            resolve_remote_root(requested, &home)
        }
    };
    let root = SyncRoot::new(&config.local_root, remote_root);
    info!("Mirroring {} -> {}", root.local().display(), root.remote());

    // Watch first so nothing changed during the initial walk is missed
    let mut watcher = DirWatcher::new(root.clone())?;
    info!("File watcher started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shared: Arc<dyn RemoteTransport> = transport.clone();
    let mut engine = SyncEngine::new(shared, root, config.engine.clone());

    let (raw_mode, shell) = if config.shell {
        let size = terminal_size();
        let session = ShellSession::start_terminal(transport.as_ref(), size, shutdown_rx.clone())
            .await
            .context("could not start the remote shell")?;
        (Some(RawModeGuard::enable()?), Some(session))
    } else {
        info!("Running without a shell. Press Ctrl+C to stop.");
        (None, None)
    };

    let sync = engine.run(watcher.event_rx(), shutdown_rx.clone());
    let shell_done = async move {
        match shell {
            Some(session) => Some(session.wait().await),
            None => std::future::pending().await,
        }
    };
    tokio::pin!(sync, shell_done);

    let (code, stats) = tokio::select! {
        stats = &mut sync => {
            warn!("File watcher stopped");
            (1, Some(stats))
        }
        status = &mut shell_done => {
            let code = match status {
                Some(Ok(code)) => {
                    info!("Remote shell exited with status {}", code);
                    code
                }
                Some(Err(e)) => {
                    error!("Remote shell failed: {}", e);
                    1
                }
                None => 0,
            };
            (code, None)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            (130, None)
        }
    };
    drop(raw_mode);

    // Let the engine finish the event in hand, then stop
    shutdown_tx.send_replace(true);
    let stats = match stats {
        Some(stats) => stats,
        None => sync.await,
    };
    info!(
        "Shutting down: {} synced, {} removed, {} failed",
        stats.synced, stats.removed, stats.failed
    );

    if let Err(e) = transport.close().await {
        warn!("Failed to close connection: {}", e);
    }
    Ok(code)
}
