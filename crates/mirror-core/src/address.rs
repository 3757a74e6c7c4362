//! Destination address parsing.
//!
//! Accepts `user[:password]@host[:port][:remotePath]`. The port defaults to
//! 22 when absent. A second host fragment made only of digits is a port,
//! anything else is the remote path (scp-style, relative paths are resolved
//! against the remote home later).

use std::fmt;
use thiserror::Error;

/// Port used when the address does not name one.
pub const DEFAULT_PORT: u16 = 22;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed address, expected user@host: {0}")]
    MissingSeparator(String),

    #[error("empty user name in address: {0}")]
    EmptyUser(String),

    #[error("empty host in address: {0}")]
    EmptyHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// A parsed destination.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    /// Remote directory to mirror into, if the address named one
    pub path: Option<String>,
}

// Keep the password out of logs.
impl fmt::Debug for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAddress")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .finish()
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)?;
        if let Some(path) = &self.path {
            write!(f, ":{}", path)?;
        }
        Ok(())
    }
}

impl RemoteAddress {
    /// Parse an address string.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        // Passwords may contain '@', the host part never does.
        let (credentials, location) = s
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingSeparator(s.to_string()))?;

        let (user, password) = match credentials.split_once(':') {
            Some((user, pass)) => (user, Some(pass.to_string())),
            None => (credentials, None),
        };
        if user.is_empty() {
            return Err(AddressError::EmptyUser(s.to_string()));
        }

        let mut fragments = location.splitn(3, ':');
        let host = fragments.next().unwrap_or_default();
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }

        let mut port = DEFAULT_PORT;
        let mut path = None;
        match (fragments.next(), fragments.next()) {
            (None, _) => {}
            (Some(second), None) => {
                if is_port_fragment(second) {
                    port = parse_port(second)?;
                } else if !second.is_empty() {
                    path = Some(second.to_string());
                }
            }
            (Some(second), Some(third)) => {
                port = parse_port(second)?;
                if !third.is_empty() {
                    path = Some(third.to_string());
                }
            }
        }

        Ok(Self {
            user: user.to_string(),
            password: password.filter(|p| !p.is_empty()),
            host: host.to_string(),
            port,
            path,
        })
    }
}

fn is_port_fragment(fragment: &str) -> bool {
    !fragment.is_empty() && fragment.bytes().all(|b| b.is_ascii_digit())
}

/// An empty fragment (`host::path`) means the default port.
fn parse_port(fragment: &str) -> Result<u16, AddressError> {
    if fragment.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    match fragment.parse::<u16>() {
        Ok(0) | Err(_) => Err(AddressError::InvalidPort(fragment.to_string())),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_and_host_only() {
        let addr = RemoteAddress::parse("alice@example.com").unwrap();
        assert_eq!(addr.user, "alice");
        assert_eq!(addr.password, None);
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 22);
        assert_eq!(addr.path, None);
    }

    #[test]
    fn test_password_port_and_path() {
        let addr = RemoteAddress::parse("bob:s3:cr@t@10.0.0.2:2222:/srv/app").unwrap();
        assert_eq!(addr.user, "bob");
        assert_eq!(addr.password.as_deref(), Some("s3:cr@t"));
        assert_eq!(addr.host, "10.0.0.2");
        assert_eq!(addr.port, 2222);
        assert_eq!(addr.path.as_deref(), Some("/srv/app"));
    }

    #[test]
    fn test_path_without_port() {
        let addr = RemoteAddress::parse("carol@box:projects/site").unwrap();
        assert_eq!(addr.port, 22);
        assert_eq!(addr.path.as_deref(), Some("projects/site"));
    }

    #[test]
    fn test_empty_port_uses_default() {
        let addr = RemoteAddress::parse("frank@host::/srv").unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.path.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_malformed_addresses() {
        assert!(matches!(
            RemoteAddress::parse("example.com"),
            Err(AddressError::MissingSeparator(_))
        ));
        assert!(matches!(
            RemoteAddress::parse("@example.com"),
            Err(AddressError::EmptyUser(_))
        ));
        assert!(matches!(
            RemoteAddress::parse("dave@"),
            Err(AddressError::EmptyHost(_))
        ));
        assert_eq!(
            RemoteAddress::parse("dave@host:99999"),
            Err(AddressError::InvalidPort("99999".to_string()))
        );
        assert_eq!(
            RemoteAddress::parse("dave@host:ssh:/tmp"),
            Err(AddressError::InvalidPort("ssh".to_string()))
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let addr = RemoteAddress::parse("erin:hunter2@host").unwrap();
        let debug = format!("{:?}", addr);
        assert!(!debug.contains("hunter2"));
        assert_eq!(addr.to_string(), "erin@host:22");
    }
}
