//! Interactive remote shell over its own session.
//!
//! Local stdin/stdout/stderr are wired to the session by three independent
//! forwarding tasks. Each forwarder stops at end of stream or when the shared
//! shutdown signal fires; all three are joined (or aborted) when the session
//! ends, so nothing outlives it.

use mirror_core::{PtySize, RemoteSession, RemoteTransport, SessionRequest, TransportError};
use std::io::{IsTerminal, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ShellSession {
    session: Box<dyn RemoteSession>,
    /// Remote stdout/stderr -> local; these end when the remote side closes
    outputs: Vec<JoinHandle<()>>,
    /// Local stdin -> remote; blocks on the terminal, so it is aborted
    input: Option<JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
}

impl ShellSession {
    /// Open the shell session wired to this process's stdin/stdout/stderr.
    pub async fn start_terminal(
        transport: &dyn RemoteTransport,
        size: PtySize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError> {
        Self::start(
            transport,
            size,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
            shutdown,
        )
        .await
    }

    /// Open the shell session and start forwarding between it and the given
    /// local streams.
    pub async fn start<I, O, E>(
        transport: &dyn RemoteTransport,
        size: PtySize,
        local_in: I,
        local_out: O,
        local_err: E,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = transport.open_session(SessionRequest::Shell(size)).await?;
        debug!("Opened shell session ({}x{})", size.cols, size.rows);

        let mut outputs = Vec::new();
        if let Some(stdout) = session.take_stdout() {
            outputs.push(tokio::spawn(forward("stdout", stdout, local_out, shutdown.clone())));
        }
        if let Some(stderr) = session.take_stderr() {
            outputs.push(tokio::spawn(forward("stderr", stderr, local_err, shutdown.clone())));
        }
        let input = session
            .take_stdin()
            .map(|stdin| tokio::spawn(forward("stdin", local_in, stdin, shutdown.clone())));

        Ok(Self {
            session,
            outputs,
            input,
            shutdown,
        })
    }

    /// Wait for the remote shell to exit (or for shutdown) and join the forwarders.
    pub async fn wait(mut self) -> Result<i32, TransportError> {
        let mut shutdown = self.shutdown.clone();
        let status = tokio::select! {
            status = self.session.wait() => status,
            _ = shutdown.wait_for(|stop| *stop) => Err(TransportError::Closed),
        };

        if let Some(input) = self.input.take() {
            input.abort();
        }
        for output in self.outputs.drain(..) {
            if let Err(e) = output.await {
                if !e.is_cancelled() {
                    warn!("Shell forwarder failed: {}", e);
                }
            }
        }
        status
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Some(input) = self.input.take() {
            input.abort();
        }
        for output in &self.outputs {
            output.abort();
        }
    }
}

/// Copy bytes until end of stream, an I/O error, or shutdown.
pub async fn forward<R, W>(
    label: &'static str,
    mut reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copy = async {
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            // Interactive output must not sit in a buffer
            writer.flush().await?;
            total += n as u64;
        }
        writer.shutdown().await?;
        Ok::<u64, std::io::Error>(total)
    };

    tokio::select! {
        result = copy => match result {
            Ok(total) => debug!("{} forwarder finished after {} bytes", label, total),
            Err(e) => debug!("{} forwarder stopped: {}", label, e),
        },
        _ = shutdown.wait_for(|stop| *stop) => debug!("{} forwarder cancelled", label),
    }
}

/// Current terminal dimensions, or 80x24 when stdout is not a terminal.
pub fn terminal_size() -> PtySize {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => PtySize { cols, rows },
        _ => PtySize::default(),
    }
}

/// Puts the local terminal into raw mode for the shell's lifetime.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    /// Enable raw mode if stdin is a terminal; a no-op otherwise.
    pub fn enable() -> std::io::Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Writer that turns bare `\n` into `\r\n`, for logging while in raw mode.
pub struct RawModeWriter<W: Write> {
    inner: W,
    /// Last byte of the previous write, so a `\r\n` split across writes stays intact
    last: Option<u8>,
}

impl<W: Write> RawModeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, last: None }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RawModeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut start = 0;
        let mut previous = self.last;
        for (i, byte) in buf.iter().enumerate() {
            if *byte == b'\n' && previous != Some(b'\r') {
                self.inner.write_all(&buf[start..i])?;
                self.inner.write_all(b"\r\n")?;
                start = i + 1;
            }
            previous = Some(*byte);
        }
        self.inner.write_all(&buf[start..])?;
        self.last = previous;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
