//! Core data types shared across the raw server

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of socket a connection or listening socket wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
    Unix,
    Multicast,
}

impl SocketKind {
    /// Datagram sockets have no accept step and no idle timeout.
    pub fn is_datagram(self) -> bool {
        matches!(self, SocketKind::Udp | SocketKind::Multicast)
    }
}

/// Address of one end of a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 or IPv6 socket address
    Inet(SocketAddr),
    /// Unix domain socket, possibly unnamed
    Unix(Option<PathBuf>),
}

impl Address {
    pub fn inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{addr}"),
            Address::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Address::Unix(None) => write!(f, "unix:<unnamed>"),
        }
    }
}

/// Key under which a listening socket registers its handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenKey {
    Port(u16),
    Path(PathBuf),
}

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
