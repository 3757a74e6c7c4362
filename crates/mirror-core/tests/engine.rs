//! Engine tests against the in-memory remote.
//!
//! Local trees live in temp directories; the remote side is an
//! `InMemoryRemote` speaking the same command/scp protocol as a real host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mirror_core::{
    EngineOptions, InMemoryRemote, RemoteTransport, SyncCause, SyncEngine, SyncRoot, WatchEvent,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    _dir: TempDir,
    local: PathBuf,
    remote: Arc<InMemoryRemote>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let local = dir.path().canonicalize().expect("Failed to canonicalize temp dir");
        Self {
            _dir: dir,
            local,
            remote: Arc::new(InMemoryRemote::new()),
        }
    }

    fn engine(&self, options: EngineOptions) -> SyncEngine {
        let transport: Arc<dyn RemoteTransport> = self.remote.clone();
        SyncEngine::new(transport, SyncRoot::new(&self.local, "/remote"), options)
    }

    fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.local.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.local.join(relative)
    }
}

/// Feed events through the full run loop and wait for it to finish.
async fn run_events(engine: &mut SyncEngine, events: Vec<WatchEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for event in events {
        tx.send(event).unwrap();
    }
    drop(tx);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    timeout(Duration::from_secs(10), engine.run(&mut rx, shutdown_rx))
        .await
        .expect("Sync loop did not finish");
}

fn skip_initial() -> EngineOptions {
    EngineOptions {
        skip_initial_sync: true,
        ..Default::default()
    }
}

// ============================================================================
// Initial sync
// ============================================================================

#[tokio::test]
async fn test_initial_sync_skips_hidden_entries() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write(".hidden/x", b"secret");
    fx.write("sub/b.txt", b"bravo");

    let mut engine = fx.engine(EngineOptions::default());
    run_events(&mut engine, vec![]).await;

    assert_eq!(fx.remote.files(), vec!["/remote/a.txt", "/remote/sub/b.txt"]);
    assert_eq!(fx.remote.read("/remote/a.txt").unwrap(), b"alpha");
    assert_eq!(fx.remote.read("/remote/sub/b.txt").unwrap(), b"bravo");
    assert_eq!(fx.remote.mode("/remote/a.txt"), Some(0o755));
    assert_eq!(engine.stats().synced, 2);
}

#[tokio::test]
async fn test_skip_initial_sync() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");

    let mut engine = fx.engine(skip_initial());
    run_events(&mut engine, vec![]).await;

    assert!(fx.remote.files().is_empty());
}

#[tokio::test]
async fn test_initial_sync_runs_before_queued_events() {
    let fx = Fixture::new();
    fx.write("a.txt", b"from walk");
    let a = fx.path("a.txt");

    // A removal queued while the walk was in progress must apply after it.
    let mut engine = fx.engine(EngineOptions::default());
    run_events(&mut engine, vec![WatchEvent::remove(&a)]).await;

    assert!(fx.remote.read("/remote/a.txt").is_none());
}

// ============================================================================
// Steady state
// ============================================================================

#[tokio::test]
async fn test_write_pushes_latest_content() {
    let fx = Fixture::new();
    let mut engine = fx.engine(skip_initial());

    let a = fx.write("notes/a.txt", b"one");
    engine.apply(&WatchEvent::create(&a)).await.unwrap();
    fx.write("notes/a.txt", b"two, longer");
    engine.apply(&WatchEvent::write(&a)).await.unwrap();

    assert_eq!(fx.remote.read("/remote/notes/a.txt").unwrap(), b"two, longer");
}

#[tokio::test]
async fn test_event_order_is_preserved() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", b"content");
    let mut engine = fx.engine(skip_initial());

    run_events(
        &mut engine,
        vec![WatchEvent::write(&a), WatchEvent::write(&a), WatchEvent::remove(&a)],
    )
    .await;

    assert!(fx.remote.read("/remote/a.txt").is_none());
    assert_eq!(engine.stats().synced, 2);
    assert_eq!(engine.stats().removed, 1);
}

#[tokio::test]
async fn test_failure_does_not_stop_loop() {
    let fx = Fixture::new();
    let b = fx.write("b.txt", b"bad");
    let c = fx.write("c.txt", b"good");
    fx.remote.fail_pushes_to("/remote/b.txt");

    let mut engine = fx.engine(skip_initial());
    run_events(&mut engine, vec![WatchEvent::write(&b), WatchEvent::write(&c)]).await;

    assert!(fx.remote.read("/remote/b.txt").is_none());
    assert_eq!(fx.remote.read("/remote/c.txt").unwrap(), b"good");
    assert_eq!(engine.stats().failed, 1);
    assert_eq!(engine.stats().synced, 1);
}

#[tokio::test]
async fn test_transfer_error_names_paths() {
    let fx = Fixture::new();
    let b = fx.write("b.txt", b"bad");
    fx.remote.fail_pushes_to("/remote/b.txt");

    let mut engine = fx.engine(skip_initial());
    let err = engine.apply(&WatchEvent::write(&b)).await.unwrap_err();

    assert_eq!(err.path, b);
    assert_eq!(err.remote, "/remote/b.txt");
    assert!(matches!(err.cause, SyncCause::Transfer(_)));
    let message = err.to_string();
    assert!(message.contains("b.txt"));
    assert!(message.contains("Permission denied"));
}

#[tokio::test]
async fn test_rename_as_single_event() {
    let fx = Fixture::new();
    let old = fx.write("old.txt", b"moving");
    let mut engine = fx.engine(skip_initial());
    engine.apply(&WatchEvent::create(&old)).await.unwrap();

    let new = fx.path("new.txt");
    std::fs::rename(&old, &new).unwrap();
    engine.apply(&WatchEvent::rename(&old, &new)).await.unwrap();

    assert!(fx.remote.read("/remote/old.txt").is_none());
    assert_eq!(fx.remote.read("/remote/new.txt").unwrap(), b"moving");
}

#[tokio::test]
async fn test_rename_as_remove_create_pair() {
    let fx = Fixture::new();
    let old = fx.write("old.txt", b"moving");
    let mut engine = fx.engine(skip_initial());
    engine.apply(&WatchEvent::create(&old)).await.unwrap();

    let new = fx.path("new.txt");
    std::fs::rename(&old, &new).unwrap();
    run_events(&mut engine, vec![WatchEvent::remove(&old), WatchEvent::create(&new)]).await;

    assert!(fx.remote.read("/remote/old.txt").is_none());
    assert_eq!(fx.remote.read("/remote/new.txt").unwrap(), b"moving");
}

#[tokio::test]
async fn test_remove_directory_removes_subtree() {
    let fx = Fixture::new();
    let file = fx.write("dir/inner/f.txt", b"f");
    let mut engine = fx.engine(skip_initial());
    engine.apply(&WatchEvent::create(&file)).await.unwrap();

    std::fs::remove_dir_all(fx.path("dir")).unwrap();
    engine.apply(&WatchEvent::remove(fx.path("dir"))).await.unwrap();

    assert!(fx.remote.files().is_empty());
    assert!(!fx.remote.is_dir("/remote/dir"));
}

#[tokio::test]
async fn test_vanished_file_is_skipped() {
    let fx = Fixture::new();
    let mut engine = fx.engine(skip_initial());

    engine
        .apply(&WatchEvent::write(fx.path("gone.txt")))
        .await
        .expect("a file deleted before its write event is not an error");
    assert!(fx.remote.files().is_empty());
}

#[tokio::test]
async fn test_event_outside_root_is_reported() {
    let fx = Fixture::new();
    let mut engine = fx.engine(skip_initial());

    let err = engine
        .apply(&WatchEvent::write(Path::new("/definitely/elsewhere.txt")))
        .await
        .unwrap_err();
    assert!(matches!(err.cause, SyncCause::Path(_)));
}

// ============================================================================
// Remote helpers and transport
// ============================================================================

#[tokio::test]
async fn test_ensure_remote_dir_is_idempotent() {
    let fx = Fixture::new();
    let engine = fx.engine(skip_initial());

    engine.ensure_remote_dir("/remote/a/b").await.unwrap();
    engine.ensure_remote_dir("/remote/a/b").await.unwrap();
    assert!(fx.remote.is_dir("/remote/a/b"));
}

#[tokio::test]
async fn test_remote_paths_are_quoted() {
    let fx = Fixture::new();
    let file = fx.write("with space/it's.txt", b"q");
    let mut engine = fx.engine(skip_initial());

    engine.apply(&WatchEvent::create(&file)).await.unwrap();
    assert_eq!(fx.remote.read("/remote/with space/it's.txt").unwrap(), b"q");
}

#[tokio::test]
async fn test_mapping_is_stable_across_syncs() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", b"a");
    let b = fx.write("b.txt", b"b");
    let mut engine = fx.engine(skip_initial());

    let before = engine.remote_path(&a).unwrap();
    engine.apply(&WatchEvent::create(&b)).await.unwrap();
    engine.apply(&WatchEvent::create(&a)).await.unwrap();
    assert_eq!(engine.remote_path(&a).unwrap(), before);
    assert_eq!(before, "/remote/a.txt");
}

#[tokio::test]
async fn test_closed_transport_is_recoverable_per_file() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", b"a");
    let mut engine = fx.engine(skip_initial());

    fx.remote.close().await.unwrap();
    let err = engine.apply(&WatchEvent::write(&a)).await.unwrap_err();
    assert!(matches!(err.cause, SyncCause::Transport(_)));
}

#[tokio::test]
async fn test_shutdown_stops_loop() {
    let fx = Fixture::new();
    let a = fx.write("a.txt", b"a");
    let mut engine = fx.engine(skip_initial());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();
    tx.send(WatchEvent::write(&a)).unwrap();

    timeout(Duration::from_secs(5), engine.run(&mut rx, shutdown_rx))
        .await
        .expect("Sync loop ignored shutdown");
    assert!(fx.remote.files().is_empty());
    drop(tx);
}

#[tokio::test]
async fn test_engine_runs_on_its_own_task() {
    let fx = Fixture::new();
    let mut engine = fx.engine(skip_initial());
    let a = fx.write("a.txt", b"spawned");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { engine.run(&mut rx, shutdown_rx).await });

    tx.send(WatchEvent::write(&a)).unwrap();
    let remote = fx.remote.clone();
    timeout(Duration::from_secs(5), async {
        while remote.read("/remote/a.txt").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Spawned sync loop did not apply the event");

    shutdown_tx.send_replace(true);
    let stats = timeout(Duration::from_secs(5), handle)
        .await
        .expect("Sync loop ignored shutdown")
        .expect("Sync task panicked");
    assert_eq!(stats.synced, 1);
}

#[tokio::test]
async fn test_commands_issued_per_push() {
    let fx = Fixture::new();
    let a = fx.write("sub/a.txt", b"a");
    let mut engine = fx.engine(skip_initial());

    engine.apply(&WatchEvent::create(&a)).await.unwrap();
    assert_eq!(
        fx.remote.commands(),
        vec!["mkdir -p /remote/sub", "scp -qt /remote/sub"]
    );
}
