//! OS-level transports driven by the scheduler's event loop
//!
//! A transport owns one socket and runs as a task on the scheduler's
//! `LocalSet`. It reports incoming data and loss through `Protocol`, and
//! accepts outgoing bytes through `Transport`.

use crate::buffer::Producer;
use crate::{Address, Error, Result, SocketKind};
use bytes::Bytes;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Weak;

mod datagram;
mod stream;

pub(crate) use datagram::DatagramTransport;
pub(crate) use stream::{ReadyStream, StreamTransport};

/// Upward interface a transport reports to.
pub(crate) trait Protocol {
    fn data_received(&self, data: Bytes);

    fn datagram_received(&self, data: Bytes, from: SocketAddr);

    /// The transport is gone. `reason` is `None` for an orderly close.
    fn connection_lost(&self, reason: Option<io::Error>);
}

/// Downward interface a connection drives its socket through.
pub(crate) trait Transport {
    fn kind(&self) -> SocketKind;

    /// Remote address. `None` for datagram sockets.
    fn peer(&self) -> Option<Address>;

    /// Local address.
    fn host(&self) -> Option<Address>;

    /// Queue bytes for sending.
    fn write(&self, chunk: Bytes) -> io::Result<()>;

    fn write_sequence(&self, chunks: Vec<Bytes>) -> io::Result<()> {
        for chunk in chunks {
            self.write(chunk)?;
        }
        Ok(())
    }

    /// Ask the transport to pull from `producer` whenever it can take more.
    fn register_producer(&self, producer: Weak<dyn Producer>);

    fn unregister_producer(&self);

    /// Call `callback` every time the transport's own send buffer empties.
    /// Returns false if the transport cannot report that.
    fn add_buffer_callback(&self, _callback: Box<dyn Fn()>) -> bool {
        false
    }

    /// Stop delivering incoming data until `resume_producing`.
    fn pause_producing(&self) -> Result<()> {
        Err(Error::NotSupported("read flow control"))
    }

    fn resume_producing(&self) -> Result<()> {
        Err(Error::NotSupported("read flow control"))
    }

    /// Flush what is queued, then close. Loss is reported through
    /// `Protocol::connection_lost`.
    fn lose_connection(&self) -> Result<()>;

    /// Flush what is queued, then close the write half only.
    fn lose_write_connection(&self) -> Result<()> {
        Err(Error::NotSupported("half-close"))
    }

    fn stop_reading(&self) -> Result<()>;

    fn set_tos(&self, tos: u32) -> io::Result<()>;

    /// Arrange for the next close to reset the connection.
    fn set_linger_reset(&self) -> io::Result<()>;

    fn shutdown_raw(&self, how: Shutdown) -> io::Result<()>;

    fn send_to(&self, _packet: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "sendto on a stream transport",
        ))
    }

    /// Whether a datagram transport currently owns a bound socket.
    fn is_listening(&self) -> bool {
        true
    }
}
