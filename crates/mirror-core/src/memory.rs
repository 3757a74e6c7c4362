//! In-memory remote host for testing.
//!
//! Implements `RemoteTransport` by interpreting the handful of commands the
//! engine issues (`mkdir -p`, `rm -rf`, `scp -qt`) against an in-memory tree.
//! Sessions run on their own tasks and talk over in-process pipes, so the
//! byte-level scp exchange is exercised exactly as it would be over ssh.

use crate::transport::{
    RemoteSession, RemoteTransport, Result, SessionReader, SessionRequest, SessionWriter,
    TransportError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{oneshot, watch};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct RemoteFile {
    mode: u32,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct RemoteState {
    files: BTreeMap<String, RemoteFile>,
    dirs: BTreeSet<String>,
    failing: HashSet<String>,
    commands: Vec<String>,
    closed: bool,
}

impl RemoteState {
    fn add_dir_all(&mut self, dir: &str) -> bool {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.files.contains_key(&current) {
                return false;
            }
            self.dirs.insert(current.clone());
        }
        true
    }

    fn remove_all(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.retain(|p, _| p != path && !p.starts_with(&prefix));
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
    }
}

/// Fake remote host. Wrap it in an `Arc` to share with an engine.
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    shutdown: watch::Sender<bool>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        state.dirs.insert("/".to_string());
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(state)),
            shutdown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// Create a directory (and parents) directly.
    pub fn add_dir(&self, dir: &str) {
        self.lock().add_dir_all(dir);
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.lock().files.get(path).map(|f| f.mode)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// All file paths, sorted.
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Every command line executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Make every push to `path` fail with a permission error.
    pub fn fail_pushes_to(&self, path: &str) {
        self.lock().failing.insert(path.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for InMemoryRemote {
    async fn open_session(&self, request: SessionRequest) -> Result<Box<dyn RemoteSession>> {
        // Shells get no command line; they echo their input
        let command = match request {
            SessionRequest::Exec(command) => Some(command),
            SessionRequest::Shell(_) => None,
        };

        {
            let mut state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if let Some(command) = &command {
                state.commands.push(command.clone());
            }
        }

        let (client_stdin, remote_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_stderr, client_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let run = async move {
                match command {
                    Some(command) => {
                        interpret(state, command, remote_stdin, remote_stdout, remote_stderr).await
                    }
                    None => echo_shell(remote_stdin, remote_stdout).await,
                }
            };
            tokio::select! {
                status = run => {
                    let _ = exit_tx.send(status);
                }
                _ = shutdown.wait_for(|closed| *closed) => {
                    // exit_tx drops: the session observes a closed transport
                }
            }
        });

        Ok(Box::new(InMemorySession {
            stdin: Some(Box::new(client_stdin)),
            stdout: Some(Box::new(client_stdout)),
            stderr: Some(Box::new(client_stderr)),
            exit: Some(exit_rx),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        self.shutdown.send_replace(true);
        Ok(())
    }
}

struct InMemorySession {
    stdin: Option<SessionWriter>,
    stdout: Option<SessionReader>,
    stderr: Option<SessionReader>,
    exit: Option<oneshot::Receiver<i32>>,
}

#[async_trait]
impl RemoteSession for InMemorySession {
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
        let exit = self
            .exit
            .take()
            .ok_or_else(|| TransportError::Session("session already waited on".into()))?;
        exit.await.map_err(|_| TransportError::Closed)
    }
}

async fn interpret(
    state: Arc<Mutex<RemoteState>>,
    command: String,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) -> i32 {
    let words = match shell_words::split(&command) {
        Ok(words) => words,
        Err(e) => {
            let _ = stderr.write_all(format!("sh: {}\n", e).as_bytes()).await;
            return 2;
        }
    };
    let args: Vec<&str> = words.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["mkdir", "-p", dirs @ ..] if !dirs.is_empty() => {
            let failed = {
                let mut state = state.lock().unwrap();
                dirs.iter().find(|dir| !state.add_dir_all(dir)).map(|d| d.to_string())
            };
            match failed {
                Some(dir) => {
                    let msg = format!("mkdir: cannot create directory '{}': File exists\n", dir);
                    let _ = stderr.write_all(msg.as_bytes()).await;
                    1
                }
                None => 0,
            }
        }
        ["rm", "-rf", paths @ ..] => {
            let mut state = state.lock().unwrap();
            for path in paths {
                state.remove_all(path);
            }
            0
        }
        ["scp", "-qt", dir] => scp_sink(&state, dir, stdin, &mut stdout).await,
        [program, ..] => {
            let msg = format!("sh: {}: command not found\n", program);
            let _ = stderr.write_all(msg.as_bytes()).await;
            127
        }
        [] => 0,
    }
}

/// Interactive shell stand-in: echoes input until it closes.
async fn echo_shell(mut stdin: DuplexStream, mut stdout: DuplexStream) -> i32 {
    match tokio::io::copy(&mut stdin, &mut stdout).await {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Receiving end of the scp protocol, one or more `C` records.
async fn scp_sink(
    state: &Arc<Mutex<RemoteState>>,
    dir: &str,
    stdin: DuplexStream,
    stdout: &mut DuplexStream,
) -> i32 {
    let dir_exists = state.lock().unwrap().dirs.contains(dir);
    if !dir_exists {
        let msg = format!("\x01scp: {}: No such file or directory\n", dir);
        let _ = stdout.write_all(msg.as_bytes()).await;
        return 1;
    }
    let _ = stdout.write_all(&[0]).await;

    let mut reader = BufReader::new(stdin);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(_) => return 1,
        }

        let Some((mode, size, name)) = parse_record(&line) else {
            let _ = stdout.write_all(b"\x02scp: protocol error: bad record\n").await;
            return 1;
        };
        let _ = stdout.write_all(&[0]).await;

        let mut body = vec![0u8; size];
        let mut terminator = [0u8; 1];
        let complete = reader.read_exact(&mut body).await.is_ok()
            && reader.read_exact(&mut terminator).await.is_ok()
            && terminator[0] == 0;
        if !complete {
            let _ = stdout
                .write_all(b"\x02scp: protocol error: unexpected end of input\n")
                .await;
            return 1;
        }

        let target = if dir.ends_with('/') {
            format!("{}{}", dir, name)
        } else {
            format!("{}/{}", dir, name)
        };
        let stored = {
            let mut state = state.lock().unwrap();
            if state.failing.contains(&target) {
                false
            } else {
                state.files.insert(target.clone(), RemoteFile { mode, content: body });
                true
            }
        };
        if !stored {
            let msg = format!("\x01scp: {}: Permission denied\n", target);
            let _ = stdout.write_all(msg.as_bytes()).await;
            return 1;
        }
        let _ = stdout.write_all(&[0]).await;
    }
}

fn parse_record(line: &[u8]) -> Option<(u32, usize, String)> {
    let line = std::str::from_utf8(line).ok()?.strip_suffix('\n')?;
    let rest = line.strip_prefix('C')?;
    let mut parts = rest.splitn(3, ' ');
    let mode = parts.next()?;
    if mode.len() != 4 {
        return None;
    }
    let mode = u32::from_str_radix(mode, 8).ok()?;
    let size = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((mode, size, name.to_string()))
}
