//! Error types for the raw server

use std::io;
use std::net::SocketAddr;

/// Result type alias for raw server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for raw server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying I/O error occurred.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A listening socket could not be created for a reason the OS did not
    /// attach an error code to.
    #[error("cannot listen on {addr}: {reason}")]
    CannotListen { addr: String, reason: String },

    /// The remote end refused an outbound connection attempt.
    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// An outbound connection attempt did not complete in time.
    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// A pending connection was closed locally before it was established.
    #[error("connection closed manually before completed")]
    ClosedBeforeEstablished,

    /// A host name passed to `start_connection` did not resolve.
    #[error("could not resolve host {host}")]
    Resolve { host: String },

    /// The transport does not provide the requested capability.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The operation is not valid for the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Classify a failed outbound connect.
    pub(crate) fn from_connect(addr: SocketAddr, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(addr),
            io::ErrorKind::TimedOut => Error::ConnectTimeout(addr),
            _ => Error::Io(err),
        }
    }

    /// Classify a failed bind/listen. Errors carrying an OS code are passed
    /// through untouched, the rest become `CannotListen`.
    pub(crate) fn from_listen(addr: impl ToString, err: io::Error) -> Self {
        if err.raw_os_error().is_some() {
            Error::Io(err)
        } else {
            Error::CannotListen {
                addr: addr.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
