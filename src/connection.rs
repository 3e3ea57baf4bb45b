//! Connections: one live or pending socket and the handler bound to it
//!
//! A `Connection` is created when an outbound connection is requested, when
//! a listener accepts a stream, or eagerly for every datagram socket. Until a
//! transport attaches, writes are queued in the connection's `OutputBuffer`.

use crate::buffer::{OutputBuffer, PushBuffer, WriteBuffer};
use crate::raw_server::{RawServer, WeakRawServer};
use crate::task::TaskHandle;
use crate::transport::{Protocol, Transport};
use crate::{Address, ConnectionId, Context, DataSource, Error, Handler, Result, SocketKind, WriteStrategy};
use bytes::Bytes;
use log::{debug, warn};
use once_cell::unsync::OnceCell;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Transform applied to every chunk passed to `Connection::write`.
pub type Encryptor = Box<dyn FnMut(Bytes) -> Bytes>;

/// One socket endpoint, live or pending.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    kind: Cell<SocketKind>,
    server: WeakRawServer,
    ip: Cell<Option<IpAddr>>,
    port: Cell<Option<u16>>,
    tos: u32,
    accept: Cell<bool>,
    dying: Cell<bool>,
    paused: Cell<bool>,
    removed: Cell<bool>,
    encrypt: RefCell<Option<Encryptor>>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    on_flushed: Rc<dyn Fn()>,
    buffer: Rc<OutputBuffer>,
    push: OnceCell<PushBuffer>,
    handler: RefCell<Option<Rc<dyn Handler>>>,
    context: RefCell<Option<Rc<dyn Context>>>,
    binding: RefCell<Option<Rc<TransportBinding>>>,
}

impl Connection {
    pub(crate) fn new(
        server: &RawServer,
        kind: SocketKind,
        handler: Option<Rc<dyn Handler>>,
        context: Option<Rc<dyn Context>>,
        tos: u32,
    ) -> Self {
        let inner = Rc::new_cyclic(|this: &Weak<ConnectionInner>| {
            let this = this.clone();
            let on_flushed: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(inner) = this.upgrade() {
                    Connection { inner }.flushed();
                }
            });
            ConnectionInner {
                id: ConnectionId::new(),
                kind: Cell::new(kind),
                server: server.downgrade(),
                ip: Cell::new(None),
                port: Cell::new(None),
                tos,
                accept: Cell::new(true),
                dying: Cell::new(false),
                paused: Cell::new(false),
                removed: Cell::new(false),
                encrypt: RefCell::new(None),
                transport: RefCell::new(None),
                buffer: OutputBuffer::new(Rc::clone(&on_flushed)),
                on_flushed,
                push: OnceCell::new(),
                handler: RefCell::new(handler),
                context: RefCell::new(context),
                binding: RefCell::new(None),
            }
        });
        Self { inner }
    }

    /// A pending outbound connection to `addr`.
    pub(crate) fn outbound(
        server: &RawServer,
        addr: SocketAddr,
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
        tos: u32,
    ) -> Self {
        let conn = Self::new(server, SocketKind::Tcp, Some(handler), context, tos);
        conn.inner.ip.set(Some(addr.ip()));
        conn.inner.port.set(Some(addr.port()));
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.kind.get()
    }

    /// Peer IP, or the local IP for datagram sockets. `None` for unix sockets.
    pub fn ip(&self) -> Option<IpAddr> {
        self.inner.ip.get()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.port.get()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.port()?))
    }

    pub fn tos(&self) -> u32 {
        self.inner.tos
    }

    /// Whether the connection may still be established.
    pub fn is_accepting(&self) -> bool {
        self.inner.accept.get()
    }

    /// Whether a terminal failure has been delivered for this connection.
    pub fn is_dying(&self) -> bool {
        self.inner.dying.get()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.get()
    }

    /// Whether a transport is attached and the connection has not been
    /// cleaned up.
    pub fn is_established(&self) -> bool {
        self.inner.transport.borrow().is_some()
    }

    pub fn is_flushed(&self) -> bool {
        self.buffer().is_flushed()
    }

    pub fn handler(&self) -> Option<Rc<dyn Handler>> {
        self.inner.handler.borrow().clone()
    }

    /// Rebind the connection to another handler.
    pub fn set_handler(&self, handler: Rc<dyn Handler>) {
        *self.inner.handler.borrow_mut() = Some(handler);
    }

    pub fn context(&self) -> Option<Rc<dyn Context>> {
        self.inner.context.borrow().clone()
    }

    pub fn set_context(&self, context: Option<Rc<dyn Context>>) {
        *self.inner.context.borrow_mut() = context;
    }

    pub fn set_encrypt(&self, encrypt: Option<Encryptor>) {
        *self.inner.encrypt.borrow_mut() = encrypt;
    }

    /// Queue bytes for sending. Failures surface later through
    /// `connection_lost`.
    pub fn write(&self, data: impl Into<Bytes>) {
        let mut chunk = data.into();
        if let Some(encrypt) = self.inner.encrypt.borrow_mut().as_mut() {
            chunk = encrypt(chunk);
        }
        self.buffer().add(chunk);
        if let Some(binding) = self.binding() {
            binding.reset_timeout();
        }
    }

    /// Send one datagram. Returns the number of bytes sent, or `None` if
    /// the send failed.
    pub fn sendto(&self, packet: &[u8], addr: SocketAddr) -> Option<usize> {
        let Some(transport) = self.transport() else {
            warn!("datagram socket never set up properly when asked to write");
            return None;
        };
        if !transport.is_listening() {
            warn!("datagram socket cleaned up already when asked to write");
        }
        match transport.send_to(packet, addr) {
            Ok(sent) => Some(sent),
            Err(e) => {
                warn!("sendto {addr} failed: {e}");
                None
            }
        }
    }

    pub fn pause_reading(&self) {
        let Some(transport) = self.transport() else {
            debug!("{self}: pause_reading without a transport");
            return;
        };
        if self.inner.paused.get() {
            return;
        }
        match transport.pause_producing() {
            Ok(()) => self.inner.paused.set(true),
            Err(e) => debug!("{self}: {e}"),
        }
    }

    pub fn resume_reading(&self) {
        let Some(transport) = self.transport() else {
            debug!("{self}: resume_reading without a transport");
            return;
        };
        if !self.inner.paused.replace(false) {
            return;
        }
        if let Err(e) = transport.resume_producing() {
            debug!("{self}: {e}");
        }
    }

    /// Close one or both directions.
    ///
    /// `Shutdown::Write` flushes what is queued and then half-closes.
    /// `Shutdown::Read` stops reading. `Shutdown::Both` is `close`.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        if how == Shutdown::Both {
            return self.close();
        }
        let transport = self
            .transport()
            .ok_or_else(|| Error::InvalidState(format!("{self} has no transport")))?;
        match how {
            Shutdown::Write => {
                self.buffer().handoff();
                self.buffer().stop_writing();
                if let Err(e) = transport.lose_write_connection() {
                    debug!("{self}: {e}, shutting down the socket directly");
                    if let Err(e) = transport.shutdown_raw(Shutdown::Write) {
                        debug!("{self}: write shutdown failed: {e}");
                    }
                }
                Ok(())
            }
            _ => transport.stop_reading(),
        }
    }

    /// Close the connection.
    ///
    /// An established connection goes through the normal loss path and
    /// its handler later sees `connection_lost`. A pending one is abandoned
    /// and its handler sees `connection_failed` right away.
    pub fn close(&self) -> Result<()> {
        if self.inner.removed.get() {
            return Ok(());
        }
        let close_with_rst = self
            .server()
            .map_or(false, |server| server.config().close_with_rst);
        let transport = self.transport();
        if close_with_rst {
            self.buffer().stop_writing();
            if let Some(transport) = &transport {
                if let Err(e) = transport.set_linger_reset() {
                    debug!("{self}: cannot set linger: {e}");
                }
            }
        } else {
            self.buffer().handoff();
            self.buffer().stop_writing();
        }

        if let Some(transport) = transport {
            return transport.lose_connection();
        }

        self.inner.accept.set(false);
        if !self.inner.dying.replace(true) {
            if let (Some(server), Some(handler)) = (self.server(), self.handler()) {
                let addr = self
                    .peer_addr()
                    .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
                let reason = Error::ClosedBeforeEstablished;
                server.make_wrapped_call("connection_failed", Some(self), || {
                    handler.connection_failed(addr, &reason)
                });
            }
        }
        Ok(())
    }

    pub(crate) fn server(&self) -> Option<RawServer> {
        self.inner.server.upgrade()
    }

    pub(crate) fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.inner.transport.borrow().clone()
    }

    pub(crate) fn binding(&self) -> Option<Rc<TransportBinding>> {
        self.inner.binding.borrow().clone()
    }

    fn buffer(&self) -> &dyn WriteBuffer {
        match self.inner.push.get() {
            Some(push) => push,
            None => self.inner.buffer.as_ref(),
        }
    }

    /// Bind the live transport. The write strategy is chosen here, once.
    pub(crate) fn attach_transport(
        &self,
        transport: Rc<dyn Transport>,
        binding: Rc<TransportBinding>,
        strategy: WriteStrategy,
    ) {
        *self.inner.transport.borrow_mut() = Some(Rc::clone(&transport));
        *self.inner.binding.borrow_mut() = Some(binding);
        self.inner.kind.set(transport.kind());

        let pushed = strategy == WriteStrategy::Push
            && self.inner.push.get().is_none()
            && PushBuffer::attach(
                Rc::clone(&transport),
                Rc::clone(&self.inner.on_flushed),
                &self.inner.buffer,
            )
            .map_or(false, |push| self.inner.push.set(push).is_ok());
        if !pushed {
            self.inner.buffer.attach_consumer(Rc::clone(&transport));
        }

        self.refresh_address();

        if self.inner.tos != 0 {
            if let Err(e) = transport.set_tos(self.inner.tos) {
                debug!("{self}: cannot set ToS {}: {e}", self.inner.tos);
            }
        }
    }

    /// Take IP and port from the transport's peer, or from its local end
    /// for sockets without one.
    pub(crate) fn refresh_address(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        if let Some(Address::Inet(addr)) = transport.peer().or_else(|| transport.host()) {
            self.inner.ip.set(Some(addr.ip()));
            self.inner.port.set(Some(addr.port()));
        }
    }

    pub(crate) fn post_init(&self, handler: Rc<dyn Handler>, context: Option<Rc<dyn Context>>) {
        *self.inner.handler.borrow_mut() = Some(handler);
        *self.inner.context.borrow_mut() = context;
    }

    pub(crate) fn set_dying(&self) {
        self.inner.dying.set(true);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.inner.removed.get()
    }

    /// Returns true the first time only.
    pub(crate) fn mark_removed(&self) -> bool {
        !self.inner.removed.replace(true)
    }

    /// Drop references to the buffer, transport and handler.
    pub(crate) fn cleanup(&self) {
        if let Some(push) = self.inner.push.get() {
            push.detach();
        }
        self.inner.buffer.detach();
        self.inner.handler.borrow_mut().take();
        self.inner.transport.borrow_mut().take();
        if let Some(binding) = self.inner.binding.borrow_mut().take() {
            binding.release();
        }
    }

    fn flushed(&self) {
        let Some(server) = self.server() else {
            return;
        };
        if self.inner.handler.borrow().is_none() {
            return;
        }
        let conn = self.clone();
        server.add_task(Duration::ZERO, move || conn.deliver_flushed());
    }

    fn deliver_flushed(&self) {
        if self.is_dying() || self.is_removed() {
            return;
        }
        if let (Some(server), Some(handler)) = (self.server(), self.handler()) {
            server.make_wrapped_call("connection_flushed", Some(self), || {
                handler.connection_flushed(self)
            });
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} connection {}", self.kind(), self.id())?;
        if let Some(addr) = self.peer_addr() {
            write!(f, " ({addr})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("ip", &self.ip())
            .field("port", &self.port())
            .field("accept", &self.is_accepting())
            .field("dying", &self.is_dying())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Glue between a transport's events and its connection: idle timeout and
/// handler dispatch.
pub(crate) struct TransportBinding {
    server: WeakRawServer,
    connection: RefCell<Option<Connection>>,
    idle: RefCell<Option<TaskHandle>>,
    timeout: Option<Duration>,
    this: Weak<TransportBinding>,
}

impl TransportBinding {
    pub(crate) fn new(server: &RawServer, conn: &Connection, timeout: Option<Duration>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            server: server.downgrade(),
            connection: RefCell::new(Some(conn.clone())),
            idle: RefCell::new(None),
            timeout,
            this: this.clone(),
        })
    }

    fn connection(&self) -> Option<Connection> {
        self.connection.borrow().clone()
    }

    /// Deliver `connection_made` and start the idle timer.
    pub(crate) fn connection_made(&self) {
        let (Some(server), Some(conn)) = (self.server.upgrade(), self.connection()) else {
            return;
        };
        if let Some(handler) = conn.handler() {
            server.make_wrapped_call("connection_made", Some(&conn), || handler.connection_made(&conn));
        }
        self.reset_timeout();
    }

    pub(crate) fn reset_timeout(&self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        if self.connection.borrow().is_none() {
            return;
        }
        if let Some(idle) = self.idle.borrow().as_ref() {
            if idle.is_active() {
                idle.reset(timeout);
                return;
            }
        }
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let this = self.this.clone();
        let handle = server.add_task(timeout, move || {
            if let Some(binding) = this.upgrade() {
                binding.expire();
            }
        });
        *self.idle.borrow_mut() = Some(handle);
    }

    fn expire(&self) {
        let Some(conn) = self.connection() else {
            return;
        };
        debug!("{conn} timed out");
        if let Some(transport) = conn.transport() {
            if let Err(e) = transport.lose_connection() {
                debug!("{conn}: closing after timeout failed: {e}");
            }
        }
    }

    /// Stop the idle timer and drop the connection.
    pub(crate) fn release(&self) {
        if let Some(idle) = self.idle.borrow_mut().take() {
            idle.cancel();
        }
        self.connection.borrow_mut().take();
    }
}

impl Protocol for TransportBinding {
    fn data_received(&self, data: Bytes) {
        self.reset_timeout();
        let (Some(server), Some(conn)) = (self.server.upgrade(), self.connection()) else {
            return;
        };
        if conn.is_dying() {
            return;
        }
        if let Some(handler) = conn.handler() {
            server.make_wrapped_call("data_came_in", Some(&conn), || {
                handler.data_came_in(DataSource::Stream(&conn), &data)
            });
        }
    }

    fn datagram_received(&self, data: Bytes, from: SocketAddr) {
        let (Some(server), Some(conn)) = (self.server.upgrade(), self.connection()) else {
            return;
        };
        if let Some(handler) = conn.handler() {
            server.make_wrapped_call("data_came_in", Some(&conn), || {
                handler.data_came_in(DataSource::Datagram(from), &data)
            });
        }
    }

    fn connection_lost(&self, reason: Option<io::Error>) {
        let (Some(server), Some(conn)) = (self.server.upgrade(), self.connection()) else {
            return;
        };
        match reason {
            Some(e) => debug!("{conn} lost: {e}"),
            None => debug!("{conn} closed"),
        }
        let weak = server.downgrade();
        server.add_task(Duration::ZERO, move || {
            if let Some(server) = weak.upgrade() {
                server.remove_socket(&conn);
            }
        });
    }
}
