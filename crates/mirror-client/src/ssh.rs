//! OpenSSH-backed transport.
//!
//! One master connection (`ssh -M -N -f`) is established and authenticated
//! up front. Every session is a separate `ssh -S <control>` client process
//! multiplexed over that master, with its own stdin/stdout/stderr pipes.
//! Closing the transport stops the master, which tears down any session
//! still in flight.

use async_trait::async_trait;
use mirror_core::transport::{Result, SessionReader, SessionWriter};
use mirror_core::{PtySize, RemoteAddress, RemoteSession, RemoteTransport, SessionRequest, TransportError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable the askpass helper reads the password from.
const ASKPASS_SECRET_ENV: &str = "SSHMIRROR_ASKPASS_SECRET";

/// How to reach and authenticate with the remote host.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// ssh binary to run
    pub program: String,
    pub address: RemoteAddress,
    /// Private key file passed with `-i`
    pub identity: Option<PathBuf>,
    /// Seconds before giving up on the TCP connection
    pub connect_timeout: u64,
}

pub struct SshTransport {
    options: SshOptions,
    /// Holds the control socket and askpass helper; removed on drop
    control_dir: TempDir,
    control_path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl SshTransport {
    /// Establish and authenticate the master connection.
    ///
    /// Returns once ssh has authenticated and backgrounded itself. Without a
    /// password or identity file, ssh may prompt on the terminal.
    pub async fn connect(options: SshOptions) -> Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("sshmirror-").tempdir()?;
        let control_path = control_dir.path().join("control");
        let log_path = control_dir.path().join("master.log");
        let log = std::fs::File::create(&log_path)?;

        let mut cmd = Command::new(&options.program);
        cmd.args(master_args(&options, &control_path))
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        if let Some(password) = &options.address.password {
            let askpass = write_askpass(control_dir.path())?;
            cmd.env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(ASKPASS_SECRET_ENV, password);
            // Older OpenSSH only consults SSH_ASKPASS when DISPLAY is set
            if std::env::var_os("DISPLAY").is_none() {
                cmd.env("DISPLAY", ":0");
            }
        }

        info!("Connecting to {}", options.address);
        let status = cmd.status().await.map_err(|e| {
            TransportError::Connect(format!("failed to run {}: {}", options.program, e))
        })?;

        if !status.success() {
            let log = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(classify_failure(&log, status.code()));
        }

        info!("Connected!");
        Ok(Self {
            options,
            control_dir,
            control_path,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Home directory of the remote user.
    pub async fn remote_home(&self) -> Result<String> {
        let mut session = self
            .open_session(SessionRequest::Exec("printf %s \"$HOME\"".to_string()))
            .await?;
        drop(session.take_stdin());

        let mut home = String::new();
        if let Some(mut stdout) = session.take_stdout() {
            stdout.read_to_string(&mut home).await?;
        }
        let status = session.wait().await?;
        if status != 0 || home.trim().is_empty() {
            return Err(TransportError::Session(format!(
                "could not determine remote home directory (status {})",
                status
            )));
        }

        let home = home.trim().to_string();
        debug!("Remote home directory: {}", home);
        Ok(home)
    }

    fn control_args(&self) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
        ]
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn open_session(&self, request: SessionRequest) -> Result<Box<dyn RemoteSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut child = Command::new(&self.options.program)
            .args(session_args(&self.options, &self.control_path, &request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Session(format!("failed to start ssh: {}", e)))?;

        Ok(Box::new(SshSession {
            stdin: child.stdin.take().map(|s| Box::new(s) as SessionWriter),
            stdout: child.stdout.take().map(|s| Box::new(s) as SessionReader),
            stderr: child.stderr.take().map(|s| Box::new(s) as SessionReader),
            child,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let output = Command::new(&self.options.program)
            .args(self.control_args())
            .args(["-O", "exit", "--", self.options.address.host.as_str()])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            warn!(
                "Stopping the master connection failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!("Closed connection to {}", self.options.address.host);
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = std::process::Command::new(&self.options.program)
            .args(self.control_args())
            .args(["-O", "exit", "--", self.options.address.host.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        debug!("Dropped control dir {}", self.control_dir.path().display());
    }
}

/// One ssh mux client process.
struct SshSession {
    child: Child,
    stdin: Option<SessionWriter>,
    stdout: Option<SessionReader>,
    stderr: Option<SessionReader>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn take_stdin(&mut self) -> Option<SessionWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<SessionReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<SessionReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        if !status.success() && self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        status
            .code()
            .ok_or_else(|| TransportError::Session("ssh session terminated by signal".into()))
    }
}

/// Arguments for the backgrounded master connection.
pub fn master_args(options: &SshOptions, control_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-M".into(),
        "-N".into(),
        "-f".into(),
        "-S".into(),
        control_path.display().to_string(),
        "-o".into(),
        format!("ConnectTimeout={}", options.connect_timeout),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        "ServerAliveInterval=15".into(),
        "-p".into(),
        options.address.port.to_string(),
        "-l".into(),
        options.address.user.clone(),
    ];
    if let Some(identity) = &options.identity {
        args.extend([
            "-i".into(),
            identity.display().to_string(),
            "-o".into(),
            "IdentitiesOnly=yes".into(),
        ]);
    }
    if options.address.password.is_some() {
        args.extend([
            "-o".into(),
            "PreferredAuthentications=keyboard-interactive,password".into(),
            "-o".into(),
            "NumberOfPasswordPrompts=1".into(),
        ]);
    }
    args.extend(["--".into(), options.address.host.clone()]);
    args
}

/// Arguments for one multiplexed session.
pub fn session_args(options: &SshOptions, control_path: &Path, request: &SessionRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-S".into(),
        control_path.display().to_string(),
        "-o".into(),
        "ControlMaster=no".into(),
        "-p".into(),
        options.address.port.to_string(),
        "-l".into(),
        options.address.user.clone(),
    ];
    let command = match request {
        SessionRequest::Exec(command) => {
            args.push("-T".into());
            command.clone()
        }
        SessionRequest::Shell(size) => {
            // Our stdin is a pipe, so force a pty and size it explicitly
            args.push("-tt".into());
            shell_command(*size)
        }
    };
    args.extend(["--".into(), options.address.host.clone(), command]);
    args
}

/// Login shell command that applies the terminal dimensions first.
pub fn shell_command(size: PtySize) -> String {
    format!(
        "stty rows {} cols {} 2>/dev/null; exec \"${{SHELL:-/bin/sh}}\" -l",
        size.rows, size.cols
    )
}

/// Map a failed master start onto auth vs. connect errors.
pub fn classify_failure(log: &str, code: Option<i32>) -> TransportError {
    let message = log
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("ssh exited with status {}", code),
            None => "ssh terminated by signal".to_string(),
        });

    let lower = log.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
    {
        TransportError::Auth(message)
    } else {
        TransportError::Connect(message)
    }
}

/// Write the askpass helper that echoes the password from the environment.
fn write_askpass(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join("askpass.sh");
    std::fs::write(
        &path,
        format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", ASKPASS_SECRET_ENV),
    )?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}
