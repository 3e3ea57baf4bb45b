//! Listening sockets
//!
//! A `ListeningSocket` is bound as soon as it is created but stays inert
//! until the scheduler starts listening on it. Stopping releases the OS
//! socket; starting again binds a fresh one to the same local address.

use crate::connection::Connection;
use crate::raw_server::WeakRawServer;
use crate::transport::DatagramTransport;
use crate::{Error, ListenKey, Result, SocketKind};
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;

const LISTEN_BACKLOG: i32 = 50;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A bound server or datagram endpoint.
#[derive(Clone)]
pub struct ListeningSocket {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    kind: SocketKind,
    port: u16,
    bind: Option<IpAddr>,
    path: Option<PathBuf>,
    tos: u32,
    local_addr: Cell<Option<SocketAddr>>,
    bound: RefCell<Option<BoundListener>>,
    acceptor: RefCell<Option<Acceptor>>,
    listening: Cell<bool>,
    registered: Cell<bool>,
    generation: Cell<u64>,
    stop: Notify,
    datagram: Option<DatagramEndpoint>,
}

/// The eager connection and transport behind a datagram socket
pub(crate) struct DatagramEndpoint {
    pub(crate) connection: Connection,
    pub(crate) transport: Rc<DatagramTransport>,
}

/// An OS listener not yet handed to the event loop
enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

/// An OS listener registered with the event loop
enum Acceptor {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl BoundListener {
    /// Register with the event loop. Must run inside the scheduler's
    /// runtime context.
    fn into_acceptor(self) -> io::Result<Acceptor> {
        match self {
            BoundListener::Tcp(listener) => Ok(Acceptor::Tcp(tokio::net::TcpListener::from_std(listener)?)),
            #[cfg(unix)]
            BoundListener::Unix(listener) => Ok(Acceptor::Unix(tokio::net::UnixListener::from_std(listener)?)),
        }
    }
}

impl Acceptor {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<Accepted>> {
        match self {
            Acceptor::Tcp(listener) => listener.poll_accept(cx).map_ok(|(stream, _)| Accepted::Tcp(stream)),
            #[cfg(unix)]
            Acceptor::Unix(listener) => listener.poll_accept(cx).map_ok(|(stream, _)| Accepted::Unix(stream)),
        }
    }
}

fn unspecified(bind: Option<IpAddr>) -> IpAddr {
    bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Bind a non-blocking TCP listener.
pub(crate) fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let listen_err = |e| Error::from_listen(addr, e);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(listen_err)?;
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(listen_err)?;
    socket.bind(&addr.into()).map_err(listen_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;
    Ok(socket.into())
}

/// Bind a non-blocking UDP socket. Multicast sockets share their port.
pub(crate) fn bind_udp(addr: SocketAddr, kind: SocketKind) -> Result<std::net::UdpSocket> {
    let listen_err = |e| Error::from_listen(addr, e);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(listen_err)?;
    if kind == SocketKind::Multicast {
        socket.set_reuse_address(true).map_err(listen_err)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true).map_err(listen_err)?;
    }
    socket.bind(&addr.into()).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;
    Ok(socket.into())
}

#[cfg(unix)]
pub(crate) fn bind_unix(path: &Path) -> Result<std::os::unix::net::UnixListener> {
    let listen_err = |e| Error::from_listen(path.display(), e);
    let listener = std::os::unix::net::UnixListener::bind(path).map_err(listen_err)?;
    listener.set_nonblocking(true).map_err(listen_err)?;
    Ok(listener)
}

impl ListeningSocket {
    pub(crate) fn tcp(port: u16, bind: Option<IpAddr>, tos: u32) -> Result<Self> {
        let listener = bind_tcp(SocketAddr::new(unspecified(bind), port))?;
        let local_addr = listener.local_addr()?;
        Ok(Self::build(
            SocketKind::Tcp,
            port,
            bind,
            None,
            tos,
            Some(local_addr),
            Some(BoundListener::Tcp(listener)),
            None,
        ))
    }

    #[cfg(unix)]
    pub(crate) fn unix(path: &Path) -> Result<Self> {
        let listener = bind_unix(path)?;
        Ok(Self::build(
            SocketKind::Unix,
            0,
            None,
            Some(path.to_path_buf()),
            0,
            None,
            Some(BoundListener::Unix(listener)),
            None,
        ))
    }

    pub(crate) fn datagram(
        kind: SocketKind,
        port: u16,
        bind: Option<IpAddr>,
        tos: u32,
        local_addr: SocketAddr,
        endpoint: DatagramEndpoint,
    ) -> Self {
        Self::build(kind, port, bind, None, tos, Some(local_addr), None, Some(endpoint))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        kind: SocketKind,
        port: u16,
        bind: Option<IpAddr>,
        path: Option<PathBuf>,
        tos: u32,
        local_addr: Option<SocketAddr>,
        bound: Option<BoundListener>,
        datagram: Option<DatagramEndpoint>,
    ) -> Self {
        Self {
            inner: Rc::new(ListenerInner {
                kind,
                port,
                bind,
                path,
                tos,
                local_addr: Cell::new(local_addr),
                bound: RefCell::new(bound),
                acceptor: RefCell::new(None),
                listening: Cell::new(false),
                registered: Cell::new(false),
                generation: Cell::new(0),
                stop: Notify::new(),
                datagram,
            }),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.kind
    }

    /// Port requested at creation; 0 means the OS picked one.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Address actually bound, for TCP and datagram sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get()
    }

    pub fn bind(&self) -> Option<IpAddr> {
        self.inner.bind
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn tos(&self) -> u32 {
        self.inner.tos
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.get()
    }

    /// The connection that stands for a datagram socket.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.datagram.as_ref().map(|d| d.connection.clone())
    }

    /// Join an IPv4 multicast group on a datagram socket.
    pub fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
        let socket = self
            .inner
            .datagram
            .as_ref()
            .and_then(|d| d.transport.socket())
            .ok_or_else(|| Error::InvalidState("not a bound datagram socket".to_string()))?;
        socket.join_multicast_v4(group, interface)?;
        Ok(())
    }

    pub fn join_multicast_v6(&self, group: &Ipv6Addr, interface: u32) -> Result<()> {
        let socket = self
            .inner
            .datagram
            .as_ref()
            .and_then(|d| d.transport.socket())
            .ok_or_else(|| Error::InvalidState("not a bound datagram socket".to_string()))?;
        socket.join_multicast_v6(group, interface)?;
        Ok(())
    }

    pub(crate) fn endpoint(&self) -> Option<&DatagramEndpoint> {
        self.inner.datagram.as_ref()
    }

    /// Key inbound connections on this socket are correlated by.
    pub(crate) fn key(&self) -> Option<ListenKey> {
        match self.inner.kind {
            SocketKind::Tcp => self.local_addr().map(|addr| ListenKey::Port(addr.port())),
            SocketKind::Unix => self.inner.path.clone().map(ListenKey::Path),
            SocketKind::Udp | SocketKind::Multicast => None,
        }
    }

    fn bound_addr(&self) -> SocketAddr {
        self.local_addr()
            .unwrap_or_else(|| SocketAddr::new(unspecified(self.inner.bind), self.inner.port))
    }

    /// Make sure an OS listener is bound, binding a fresh one after a stop.
    pub(crate) fn prepare(&self) -> Result<()> {
        if self.inner.bound.borrow().is_some() {
            return Ok(());
        }
        let bound = match self.inner.kind {
            #[cfg(unix)]
            SocketKind::Unix => {
                let path = self
                    .inner
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::InvalidState("unix socket without a path".to_string()))?;
                BoundListener::Unix(bind_unix(path)?)
            }
            SocketKind::Tcp => BoundListener::Tcp(bind_tcp(self.bound_addr())?),
            kind => return Err(Error::InvalidState(format!("{kind:?} socket has no listener"))),
        };
        *self.inner.bound.borrow_mut() = Some(bound);
        Ok(())
    }

    /// Fresh datagram socket on the originally bound address.
    pub(crate) fn rebind_datagram(&self) -> Result<std::net::UdpSocket> {
        bind_udp(self.bound_addr(), self.inner.kind)
    }

    /// Record whether a handler binding is registered for this socket.
    /// Returns the previous value.
    pub(crate) fn set_registered(&self, registered: bool) -> bool {
        self.inner.registered.replace(registered)
    }

    /// Mark the socket listening. Returns false if it already was.
    pub(crate) fn begin(&self) -> bool {
        !self.inner.listening.replace(true)
    }

    /// Stop listening and release the OS socket. Returns false if the socket
    /// was not listening.
    pub(crate) fn halt(&self) -> bool {
        let was_listening = self.inner.listening.replace(false);
        self.inner.generation.set(self.inner.generation.get() + 1);
        self.inner.stop.notify_waiters();
        let had_bound = self.inner.bound.borrow_mut().take().is_some();
        let had_acceptor = self.inner.acceptor.borrow_mut().take().is_some();
        if let Some(endpoint) = &self.inner.datagram {
            endpoint.transport.detach_socket();
        }
        if was_listening || had_bound || had_acceptor {
            if let Some(path) = &self.inner.path {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("could not remove unix socket {}: {e}", path.display());
                }
            }
        }
        was_listening
    }

    /// Poll the registered acceptor of listening period `generation`.
    /// Resolves to `None` once that period has ended.
    fn poll_accept(&self, generation: u64, cx: &mut Context<'_>) -> Poll<Option<io::Result<Accepted>>> {
        if self.inner.generation.get() != generation {
            return Poll::Ready(None);
        }
        match self.inner.acceptor.borrow().as_ref() {
            Some(acceptor) => acceptor.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    }

    /// Accept loop for the current listening period. The OS listener is
    /// registered with the event loop on first poll and stays owned by the
    /// socket, so `halt` closes it at once.
    pub(crate) fn serve(&self, server: WeakRawServer, key: ListenKey) -> impl Future<Output = ()> + 'static {
        let this = self.clone();
        let generation = this.inner.generation.get();
        async move {
            if this.inner.generation.get() != generation {
                return;
            }
            let Some(bound) = this.inner.bound.borrow_mut().take() else {
                return;
            };
            match bound.into_acceptor() {
                Ok(acceptor) => *this.inner.acceptor.borrow_mut() = Some(acceptor),
                Err(e) => {
                    warn!("cannot accept on {key:?}: {e}");
                    this.inner.listening.set(false);
                    return;
                }
            }
            while this.inner.generation.get() == generation {
                tokio::select! {
                    _ = this.inner.stop.notified() => {}
                    accepted = std::future::poll_fn(|cx| this.poll_accept(generation, cx)) => match accepted {
                        None => break,
                        Some(Ok(stream)) => {
                            let Some(server) = server.upgrade() else {
                                break;
                            };
                            match stream {
                                Accepted::Tcp(stream) => server.adopt_inbound(&key, stream),
                                #[cfg(unix)]
                                Accepted::Unix(stream) => server.adopt_inbound(&key, stream),
                            }
                        }
                        Some(Err(e)) => {
                            warn!("accept failed on {key:?}: {e}");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            debug!("stopped accepting on {key:?}");
        }
    }
}

impl std::fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSocket")
            .field("kind", &self.inner.kind)
            .field("port", &self.inner.port)
            .field("local_addr", &self.local_addr())
            .field("path", &self.inner.path)
            .field("listening", &self.inner.listening.get())
            .finish()
    }
}
