//! Callback interfaces implemented by upper layers
//!
//! A `Handler` receives lifecycle and data events for the connections it is
//! bound to. A `Context` receives faults raised by handler code running on
//! behalf of a particular connection. Both are only ever invoked on the
//! scheduler thread.

use crate::{Connection, Error};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

/// Result returned by handler callbacks
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Where incoming bytes came from
#[derive(Clone, Copy)]
pub enum DataSource<'a> {
    /// Bytes read from a stream connection
    Stream(&'a Connection),
    /// A datagram received from the given peer
    Datagram(SocketAddr),
}

impl fmt::Debug for DataSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Stream(conn) => f.debug_tuple("Stream").field(&conn.id()).finish(),
            DataSource::Datagram(addr) => f.debug_tuple("Datagram").field(addr).finish(),
        }
    }
}

/// Receiver of connection events.
///
/// A connection request ends in exactly one of `connection_made` or
/// `connection_failed`. After `connection_failed` or `connection_lost` no
/// further callbacks are made for that connection.
pub trait Handler {
    /// The connection is established and ready for writing.
    fn connection_made(&self, _conn: &Connection) -> HandlerResult {
        Ok(())
    }

    /// A connection request failed, was refused, or was closed before it
    /// completed.
    fn connection_failed(&self, _addr: SocketAddr, _reason: &Error) -> HandlerResult {
        Ok(())
    }

    fn data_came_in(&self, _source: DataSource<'_>, _data: &[u8]) -> HandlerResult {
        Ok(())
    }

    /// The write buffer emptied completely.
    fn connection_flushed(&self, _conn: &Connection) -> HandlerResult {
        Ok(())
    }

    /// An established connection went away, whether lost, timed out or
    /// closed locally.
    fn connection_lost(&self, _conn: &Connection) -> HandlerResult {
        Ok(())
    }
}

/// Receiver of faults attributed to a connection.
pub trait Context {
    fn got_exception(&self, fault: &Fault);
}

/// What went wrong inside a handler callback
#[derive(Debug)]
pub enum FaultKind {
    /// The callback returned an error.
    Error(Box<dyn std::error::Error>),
    /// The callback panicked; the payload message if it had one.
    Panic(String),
}

/// A handler fault caught by the scheduler
#[derive(Debug)]
pub struct Fault {
    /// Name of the callback that failed
    pub callable: &'static str,
    pub kind: FaultKind,
}

impl Fault {
    pub(crate) fn error(callable: &'static str, err: Box<dyn std::error::Error>) -> Self {
        Self {
            callable,
            kind: FaultKind::Error(err),
        }
    }

    pub(crate) fn panic(callable: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            callable,
            kind: FaultKind::Panic(message),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FaultKind::Error(err) => write!(f, "{} returned an error: {}", self.callable, err),
            FaultKind::Panic(msg) => write!(f, "{} panicked: {}", self.callable, msg),
        }
    }
}
