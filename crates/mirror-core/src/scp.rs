//! Single-file push over the scp sink protocol.
//!
//! Per push, one session runs `scp -qt <dir>` on the remote host and we feed
//! its stdin:
//!
//! ```text
//! C0755 <size> <name>\n
//! <exactly size bytes>
//! \0
//! ```
//!
//! then close stdin and wait for the receiver to exit. The receiver answers
//! on stdout with one status byte per step: `\0` for ok, `\x01`/`\x02`
//! followed by a message line for errors. The body is written from its own
//! task so the remote can run and acknowledge while bytes stream in.

use crate::paths::{remote_file_name, remote_parent};
use crate::transport::{RemoteTransport, SessionReader, SessionRequest, SessionWriter, TransportError};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Remote receiver, bound to a destination directory per push.
pub const RECEIVER_COMMAND: &str = "scp -qt";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid file name for transfer: {0:?}")]
    InvalidFileName(String),

    #[error("could not open transfer session for {path}: {source}")]
    Session {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("transfer to {path} declared {declared} bytes but only {written} were available")]
    SizeMismatch {
        path: String,
        declared: u64,
        written: u64,
    },

    #[error("remote receiver for {path} exited with status {status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    RemoteExit {
        path: String,
        status: i32,
        message: Option<String>,
    },

    #[error("stream error while pushing {path}: {source}")]
    Stream {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The `C` control line that precedes a file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub mode: u32,
    pub size: u64,
    pub file_name: String,
}

impl TransferHeader {
    /// Build a header. The file name must be a bare base name.
    pub fn new(mode: u32, size: u64, file_name: &str) -> Result<Self, TransferError> {
        let valid = !file_name.is_empty()
            && file_name != "."
            && file_name != ".."
            && !file_name.contains(['/', '\n', '\0']);
        if !valid {
            return Err(TransferError::InvalidFileName(file_name.to_string()));
        }
        Ok(Self {
            mode: mode & 0o7777,
            size,
            file_name: file_name.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TransferHeader {
    /// The receiver requires exactly four octal mode digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "C{:04o} {} {}", self.mode, self.size, self.file_name)
    }
}

enum BodyError {
    Short(u64),
    Io(std::io::Error),
}

impl From<std::io::Error> for BodyError {
    fn from(e: std::io::Error) -> Self {
        BodyError::Io(e)
    }
}

/// Push `size` bytes from `source` to `remote_path`.
///
/// `size` must be snapshotted by the caller right before streaming. If the
/// source yields fewer bytes the push fails with `SizeMismatch` instead of
/// waiting on the receiver. The destination directory must already exist.
pub async fn push<T, S>(
    transport: &T,
    source: S,
    size: u64,
    mode: u32,
    remote_path: &str,
) -> Result<(), TransferError>
where
    T: RemoteTransport + ?Sized,
    S: AsyncRead + Send + Unpin + 'static,
{
    let header = TransferHeader::new(mode, size, remote_file_name(remote_path))?;
    let command = format!(
        "{} {}",
        RECEIVER_COMMAND,
        shell_words::quote(remote_parent(remote_path))
    );

    let session_error = |source| TransferError::Session {
        path: remote_path.to_string(),
        source,
    };

    let mut session = transport
        .open_session(SessionRequest::Exec(command))
        .await
        .map_err(session_error)?;
    let stdin = session
        .take_stdin()
        .ok_or_else(|| session_error(TransportError::Session("session has no stdin".into())))?;
    let stdout = session.take_stdout();
    let stderr = session.take_stderr();

    debug!("Pushing {} ({} bytes)", remote_path, size);
    let writer = tokio::spawn(write_body(stdin, header, source));
    let (acks, _) = tokio::join!(drain(stdout), drain(stderr));

    let written = writer.await.map_err(|e| TransferError::Stream {
        path: remote_path.to_string(),
        source: std::io::Error::other(e),
    })?;
    let status = session.wait().await.map_err(session_error)?;

    if let Err(BodyError::Short(written)) = written {
        return Err(TransferError::SizeMismatch {
            path: remote_path.to_string(),
            declared: size,
            written,
        });
    }
    if status != 0 {
        return Err(TransferError::RemoteExit {
            path: remote_path.to_string(),
            status,
            message: receiver_error(&acks),
        });
    }
    if let Err(BodyError::Io(source)) = written {
        return Err(TransferError::Stream {
            path: remote_path.to_string(),
            source,
        });
    }
    Ok(())
}

async fn write_body<S>(
    mut stdin: SessionWriter,
    header: TransferHeader,
    source: S,
) -> Result<u64, BodyError>
where
    S: AsyncRead + Send + Unpin,
{
    stdin.write_all(header.encode().as_bytes()).await?;

    let mut body = source.take(header.size);
    let written = tokio::io::copy(&mut body, &mut stdin).await?;
    if written != header.size {
        // stdin drops here without a terminator, so the receiver sees EOF
        return Err(BodyError::Short(written));
    }

    stdin.write_all(&[0]).await?;
    stdin.shutdown().await?;
    Ok(written)
}

async fn drain(reader: Option<SessionReader>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("Stopped draining session output: {}", e);
        }
    }
    buf
}

/// First warning/fatal message in a receiver's status stream.
pub fn receiver_error(acks: &[u8]) -> Option<String> {
    let start = acks.iter().position(|b| *b == 1 || *b == 2)?;
    let rest = &acks[start + 1..];
    let line = rest.split(|b| *b == b'\n').next().unwrap_or_default();
    let message = String::from_utf8_lossy(line).trim().to_string();
    if message.is_empty() {
        None
    } else {
        Some(message)
    }
}
