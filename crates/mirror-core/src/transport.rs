//! RemoteTransport trait for talking to the remote host.
//!
//! A transport owns one authenticated, multiplexed connection. Every remote
//! action runs in its own short-lived session with exclusively owned
//! stdin/stdout/stderr streams.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `SshTransport` (in mirror-client) - OpenSSH ControlMaster multiplexing

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport is closed")]
    Closed,

    #[error("Session failed: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type SessionReader = Box<dyn AsyncRead + Send + Unpin>;

/// Terminal dimensions requested for an interactive shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// What a session is bound to for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Run one shell command line on the remote host
    Exec(String),
    /// Interactive login shell on a pseudo-terminal
    Shell(PtySize),
}

/// One logical channel over a transport.
///
/// Each stream can be taken exactly once; dropping the stdin writer closes
/// the remote side's input.
#[async_trait]
pub trait RemoteSession: Send {
    fn take_stdin(&mut self) -> Option<SessionWriter>;

    fn take_stdout(&mut self) -> Option<SessionReader>;

    fn take_stderr(&mut self) -> Option<SessionReader>;

    /// Wait for the remote command to finish and return its exit status.
    async fn wait(&mut self) -> Result<i32>;
}

/// The capability the engine and shell hold: open sessions, close the whole thing.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open_session(&self, request: SessionRequest) -> Result<Box<dyn RemoteSession>>;

    /// Release the connection. Idempotent; pending session I/O fails afterwards.
    async fn close(&self) -> Result<()>;
}
