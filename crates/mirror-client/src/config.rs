//! Command-line configuration.
//!
//! `Args` is parsed once by clap and turned into a `Config` value that the
//! transport, watcher and engine constructors receive.

use clap::Parser;
use mirror_core::{AddressError, EngineOptions, RemoteAddress};
use std::path::PathBuf;

use crate::ssh::SshOptions;

/// Environment variable that overrides the ssh program.
pub const SSH_PROGRAM_ENV: &str = "SSHMIRROR_SSH";

#[derive(Parser, Debug)]
#[command(name = "sshmirror")]
#[command(about = "Mirror a local directory onto a remote host while working in a remote shell")]
pub struct Args {
    /// Destination: user[:password]@host[:port][:remote_path]
    pub destination: String,

    /// Local directory to mirror
    #[arg(short, long, default_value = ".")]
    pub local_dir: PathBuf,

    /// Do not push existing files at startup
    #[arg(long)]
    pub skip_initial_sync: bool,

    /// Remote directory to use when the destination names none
    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Private key file used for authentication
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Permission bits for pushed files, in octal
    #[arg(long, default_value = "0755", value_parser = parse_mode)]
    pub file_mode: u32,

    /// Mirror only, without an interactive shell
    #[arg(long)]
    pub no_shell: bool,

    /// Seconds to wait for the connection to be established
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Runtime configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical local root
    pub local_root: PathBuf,
    /// Remote directory from the destination or `--remote-dir`, unresolved
    pub remote_dir: Option<String>,
    pub engine: EngineOptions,
    pub ssh: SshOptions,
    /// Open an interactive shell alongside the mirror
    pub shell: bool,
}

impl Config {
    /// Validate the command line and resolve the local root.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let address = RemoteAddress::parse(&args.destination)?;

        let local_root = args
            .local_dir
            .canonicalize()
            .map_err(|source| ConfigError::LocalDir {
                path: args.local_dir.clone(),
                source,
            })?;
        if !local_root.is_dir() {
            return Err(ConfigError::NotADirectory(local_root));
        }

        let remote_dir = address.path.clone().or(args.remote_dir);

        Ok(Self {
            local_root,
            remote_dir,
            engine: EngineOptions {
                file_mode: args.file_mode,
                skip_initial_sync: args.skip_initial_sync,
            },
            ssh: SshOptions {
                program: ssh_program(),
                address,
                identity: args.identity,
                connect_timeout: args.connect_timeout,
            },
            shell: !args.no_shell,
        })
    }
}

/// The ssh binary to run: `SSHMIRROR_SSH` if set, otherwise `ssh` from PATH.
pub fn ssh_program() -> String {
    std::env::var(SSH_PROGRAM_ENV)
        .ok()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "ssh".to_string())
}

/// Resolve the remote root against the remote home directory.
///
/// `~` and relative paths are taken relative to `home`, like scp does.
pub fn resolve_remote_root(requested: Option<&str>, home: &str) -> String {
    let home = home.trim_end_matches('/');
    let home = if home.is_empty() { "/" } else { home };
    match requested {
        None | Some("") | Some("~") => home.to_string(),
        Some(path) if path.starts_with('/') => path.to_string(),
        Some(path) => {
            let rest = path.strip_prefix("~/").unwrap_or(path);
            if home == "/" {
                format!("/{}", rest)
            } else {
                format!("{}/{}", home, rest)
            }
        }
    }
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("invalid octal file mode: {}", s)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("cannot use local directory {}: {source}", .path.display())]
    LocalDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local root is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}
