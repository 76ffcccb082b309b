//! Network kinds and addresses

use crate::error::ConfigError;

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transport the engine listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// TCP; one connection per accepted socket
    Stream,
    /// UDP; one connection per remote peer on a bound socket
    Datagram,
    /// Unix-domain stream socket
    Local,
}

impl NetworkKind {
    /// Whether connections are created by `accept()`.
    #[inline]
    pub const fn is_accepting(&self) -> bool {
        matches!(self, NetworkKind::Stream | NetworkKind::Local)
    }
}

impl FromStr for NetworkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" | "stream" => Ok(NetworkKind::Stream),
            "udp" | "udp4" | "udp6" | "datagram" => Ok(NetworkKind::Datagram),
            "unix" | "local" => Ok(NetworkKind::Local),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkKind::Stream => write!(f, "tcp"),
            NetworkKind::Datagram => write!(f, "udp"),
            NetworkKind::Local => write!(f, "unix"),
        }
    }
}

/// A resolved address to bind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl BindAddr {
    /// Resolve a configured address string for `network`.
    ///
    /// Inet addresses accept the Go-style `":port"` shorthand for all
    /// interfaces, literal `ip:port`, and `host:port` (first resolved
    /// address wins). Local addresses are filesystem paths.
    pub fn parse(network: NetworkKind, s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidAddress(s.to_string()));
        }

        if network == NetworkKind::Local {
            return Ok(BindAddr::Unix(PathBuf::from(s)));
        }

        let full = if s.starts_with(':') {
            format!("0.0.0.0{}", s)
        } else {
            s.to_string()
        };

        if let Ok(addr) = full.parse::<SocketAddr>() {
            return Ok(BindAddr::Inet(addr));
        }

        full.to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .map(BindAddr::Inet)
            .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Inet(addr) => write!(f, "{}", addr),
            BindAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Address of a connection endpoint.
///
/// Unix-domain peers are usually unnamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Inet(SocketAddr),
    Unix(Option<PathBuf>),
}

impl Address {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Address::Unix(Some(path)) => Some(path),
            _ => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Inet(addr)
    }
}

impl From<&std::os::unix::net::SocketAddr> for Address {
    fn from(addr: &std::os::unix::net::SocketAddr) -> Self {
        Address::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

impl From<&BindAddr> for Address {
    fn from(addr: &BindAddr) -> Self {
        match addr {
            BindAddr::Inet(a) => Address::Inet(*a),
            BindAddr::Unix(p) => Address::Unix(Some(p.clone())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{}", addr),
            Address::Unix(Some(path)) => write!(f, "{}", path.display()),
            Address::Unix(None) => write!(f, "@"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_kind_parse() {
        assert_eq!("tcp".parse::<NetworkKind>().unwrap(), NetworkKind::Stream);
        assert_eq!("UDP".parse::<NetworkKind>().unwrap(), NetworkKind::Datagram);
        assert_eq!("local".parse::<NetworkKind>().unwrap(), NetworkKind::Local);
        assert!(matches!("sctp".parse::<NetworkKind>(), Err(ConfigError::UnknownNetwork(_))));
        assert!(NetworkKind::Local.is_accepting());
        assert!(!NetworkKind::Datagram.is_accepting());
    }

    #[test]
    fn test_bind_addr_port_shorthand() {
        let addr = BindAddr::parse(NetworkKind::Stream, ":8080").unwrap();
        assert_eq!(addr, BindAddr::Inet("0.0.0.0:8080".parse().unwrap()));
    }

    #[test]
    fn test_bind_addr_literal_and_invalid() {
        let addr = BindAddr::parse(NetworkKind::Datagram, "127.0.0.1:0").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:0");
        assert!(BindAddr::parse(NetworkKind::Stream, "").is_err());
        assert!(BindAddr::parse(NetworkKind::Stream, "no-port-here").is_err());
    }

    #[test]
    fn test_bind_addr_unix_path() {
        let addr = BindAddr::parse(NetworkKind::Local, "/tmp/shardio.sock").unwrap();
        assert_eq!(addr, BindAddr::Unix(PathBuf::from("/tmp/shardio.sock")));
        assert_eq!(Address::from(&addr).as_path(), Some(Path::new("/tmp/shardio.sock")));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Unix(None).to_string(), "@");
        let inet: Address = "10.0.0.1:5".parse::<SocketAddr>().unwrap().into();
        assert_eq!(inet.to_string(), "10.0.0.1:5");
        assert!(inet.as_inet().is_some());
    }
}
