//! Datagram transport for UDP and multicast sockets

use super::{Protocol, Transport};
use crate::buffer::Producer;
use crate::{Address, Result, SocketKind};
use bytes::Bytes;
use log::debug;
use socket2::SockRef;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Transport over a bound datagram socket.
///
/// The socket can be detached and a new one attached later; a receive loop
/// started for an earlier socket ends as soon as it notices the swap.
pub(crate) struct DatagramTransport {
    kind: SocketKind,
    socket: RefCell<Option<Rc<UdpSocket>>>,
    generation: Cell<u64>,
    stop: Notify,
}

impl DatagramTransport {
    pub(crate) fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            socket: RefCell::new(None),
            generation: Cell::new(0),
            stop: Notify::new(),
        }
    }

    pub(crate) fn socket(&self) -> Option<Rc<UdpSocket>> {
        self.socket.borrow().clone()
    }

    pub(crate) fn attach_socket(&self, socket: UdpSocket) {
        self.detach_socket();
        *self.socket.borrow_mut() = Some(Rc::new(socket));
    }

    /// Drop the current socket. Returns whether one was attached.
    pub(crate) fn detach_socket(&self) -> bool {
        self.generation.set(self.generation.get() + 1);
        self.stop.notify_waiters();
        self.socket.borrow_mut().take().is_some()
    }

    /// Receive loop for the socket attached right now.
    pub(crate) fn receive(
        self: &Rc<Self>,
        protocol: Rc<dyn Protocol>,
        read_size: usize,
    ) -> impl Future<Output = ()> + 'static {
        let this = Rc::clone(self);
        let generation = this.generation.get();
        async move {
            if this.generation.get() != generation {
                return;
            }
            let Some(socket) = this.socket() else {
                return;
            };
            let mut buf = vec![0u8; read_size];
            while this.generation.get() == generation {
                tokio::select! {
                    _ = this.stop.notified() => {}
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, from)) => {
                            protocol.datagram_received(Bytes::copy_from_slice(&buf[..n]), from);
                        }
                        Err(e) => debug!("datagram receive failed: {e}"),
                    }
                }
            }
        }
    }

    fn with_socket<T>(&self, f: impl FnOnce(SockRef<'_>) -> io::Result<T>) -> io::Result<T> {
        match self.socket() {
            Some(socket) => f(SockRef::from(&*socket)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket not listening")),
        }
    }
}

impl Transport for DatagramTransport {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn peer(&self) -> Option<Address> {
        None
    }

    fn host(&self) -> Option<Address> {
        self.socket()
            .and_then(|socket| socket.local_addr().ok())
            .map(Address::Inet)
    }

    fn write(&self, _chunk: Bytes) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "datagram sockets need a destination",
        ))
    }

    fn register_producer(&self, _producer: Weak<dyn Producer>) {}

    fn unregister_producer(&self) {}

    fn lose_connection(&self) -> Result<()> {
        self.detach_socket();
        Ok(())
    }

    fn stop_reading(&self) -> Result<()> {
        self.detach_socket();
        Ok(())
    }

    fn set_tos(&self, tos: u32) -> io::Result<()> {
        self.with_socket(|sock| sock.set_tos(tos))
    }

    fn set_linger_reset(&self) -> io::Result<()> {
        self.with_socket(|sock| sock.set_linger(Some(Duration::ZERO)))
    }

    fn shutdown_raw(&self, how: Shutdown) -> io::Result<()> {
        self.with_socket(|sock| sock.shutdown(how))
    }

    fn send_to(&self, packet: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket() {
            Some(socket) => socket.try_send_to(packet, addr),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket not listening")),
        }
    }

    fn is_listening(&self) -> bool {
        self.socket.borrow().is_some()
    }
}
