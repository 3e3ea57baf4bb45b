//! Event-driven network I/O and task scheduling
//!
//! A [`RawServer`] multiplexes TCP, Unix, UDP and multicast sockets together
//! with timer-based callbacks on a single thread. Upper layers implement
//! [`Handler`] to receive connection events; other threads hand work to the
//! scheduler through a [`RawServerHandle`].

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod listener;
pub mod pending;
pub mod raw_server;
pub mod signal;
pub mod task;
pub mod types;

mod buffer;
mod factory;
mod transport;

pub use config::{Config, WriteStrategy};
pub use connection::{Connection, Encryptor};
pub use error::{Error, Result};
pub use handler::{Context, DataSource, Fault, FaultKind, Handler, HandlerResult};
pub use listener::ListeningSocket;
pub use pending::PendingConnections;
pub use raw_server::{RawServer, RawServerHandle, WeakRawServer};
pub use signal::DoneFlag;
pub use task::{ExternalTaskHandle, TaskHandle};
pub use types::{Address, ConnectionId, ListenKey, SocketKind};

#[cfg(test)]
mod tests;
