//! mirror-client library: Exposes the native components for testing.
//!
//! This is a thin library layer over the binary's components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod shell;
pub mod ssh;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Config, ConfigError};
pub use shell::ShellSession;
pub use ssh::{SshOptions, SshTransport};
pub use watcher::{DirWatcher, WatchError};
