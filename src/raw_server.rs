//! The scheduler: sockets, timers and cross-thread task injection
//!
//! A `RawServer` owns a current-thread tokio runtime and a `LocalSet`. Every
//! socket task, the timer queue and the queue of work submitted from other
//! threads run on that set, so handler code only ever runs on the thread
//! inside `listen_forever`.

use crate::connection::{Connection, TransportBinding};
use crate::factory::{ConnectionFactory, ListenerBinding};
use crate::handler::{Fault, HandlerResult};
use crate::listener::{bind_udp, DatagramEndpoint, ListeningSocket};
use crate::pending::PendingConnections;
use crate::task::{ExternalTaskHandle, TaskHandle, TaskQueue};
use crate::transport::{DatagramTransport, Protocol, ReadyStream, StreamTransport, Transport};
use crate::{Config, ConnectionId, Context, DoneFlag, Error, Handler, ListenKey, Result, SocketKind};
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Notify};
use tokio::task::LocalSet;

/// Work submitted from another thread
type RemoteTask = Box<dyn FnOnce(&RawServer) + Send>;

/// State shared with `RawServerHandle`s on other threads
struct RemoteShared {
    sender: mpsc::UnboundedSender<RemoteTask>,
    shutting_down: AtomicBool,
    pending: PendingConnections,
    sigint_installed: AtomicBool,
    done: Mutex<Option<DoneFlag>>,
}

struct ServerInner {
    // Declared first so spawned tasks are dropped before the runtime.
    local: LocalSet,
    runtime: Runtime,
    config: Config,
    remote: Arc<RemoteShared>,
    receiver: RefCell<Option<mpsc::UnboundedReceiver<RemoteTask>>>,
    tasks: Rc<TaskQueue>,
    factory: ConnectionFactory,
    connections: RefCell<HashMap<ConnectionId, Connection>>,
    udp_sockets: RefCell<HashMap<ConnectionId, Connection>>,
    owner: Cell<Option<ThreadId>>,
    listened: Cell<bool>,
    running: Cell<bool>,
    stop_signal: Notify,
    drained: Notify,
}

/// Event loop and task scheduler.
///
/// The server is `!Send`: it lives on one thread. Other threads interact
/// with it through a [`RawServerHandle`].
///
/// ```no_run
/// use rawserver::{Config, DoneFlag, Handler, RawServer};
/// use std::rc::Rc;
///
/// struct Echo;
/// impl Handler for Echo {}
///
/// let server = RawServer::new(Config::default())?;
/// let socket = server.create_serversocket(6881, None, 0)?;
/// server.start_listening(&socket, Rc::new(Echo), None)?;
/// server.listen_forever(DoneFlag::new());
/// # Ok::<(), rawserver::Error>(())
/// ```
#[derive(Clone)]
pub struct RawServer {
    inner: Rc<ServerInner>,
}

/// Non-owning reference to a `RawServer`.
#[derive(Clone)]
pub struct WeakRawServer {
    inner: Weak<ServerInner>,
}

impl WeakRawServer {
    pub fn upgrade(&self) -> Option<RawServer> {
        self.inner.upgrade().map(|inner| RawServer { inner })
    }
}

/// Thread-safe handle for submitting work to a `RawServer`.
#[derive(Clone)]
pub struct RawServerHandle {
    remote: Arc<RemoteShared>,
}

impl RawServerHandle {
    /// Run `task` on the scheduler thread after `delay`.
    ///
    /// Even a zero delay never runs the task inline; it runs on a later loop
    /// iteration. Once the server has begun shutting down, new tasks are
    /// dropped.
    pub fn external_add_task<F>(&self, delay: Duration, task: F) -> ExternalTaskHandle
    where
        F: FnOnce(&RawServer) + Send + 'static,
    {
        let handle = ExternalTaskHandle::new();
        if self.remote.shutting_down.load(Ordering::SeqCst) {
            debug!("dropping task submitted during shutdown");
            return handle;
        }
        let cancelled = handle.flag();
        let remote: RemoteTask = Box::new(move |server: &RawServer| {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            let weak = server.downgrade();
            server.add_task(delay, move || {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(server) = weak.upgrade() {
                    task(&server);
                }
            });
        });
        if self.remote.sender.send(remote).is_err() {
            debug!("scheduler is gone, dropping task");
        }
        handle
    }

    /// Ask the scheduler to stop from any thread.
    pub fn request_stop(&self) {
        self.external_add_task(Duration::ZERO, |server| server.stop());
    }

    pub fn is_shutting_down(&self) -> bool {
        self.remote.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of distinct destinations with an outbound attempt in flight.
    pub fn pending_count(&self) -> usize {
        self.remote.pending.len()
    }

    pub fn is_pending(&self, ip: IpAddr) -> bool {
        self.remote.pending.contains(ip)
    }

    fn done_flag(&self) -> Option<DoneFlag> {
        self.remote
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RawServer {
    pub fn new(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Rc::new(ServerInner {
                local: LocalSet::new(),
                runtime,
                config,
                remote: Arc::new(RemoteShared {
                    sender,
                    shutting_down: AtomicBool::new(false),
                    pending: PendingConnections::new(),
                    sigint_installed: AtomicBool::new(false),
                    done: Mutex::new(None),
                }),
                receiver: RefCell::new(Some(receiver)),
                tasks: TaskQueue::new(),
                factory: ConnectionFactory::new(),
                connections: RefCell::new(HashMap::new()),
                udp_sockets: RefCell::new(HashMap::new()),
                owner: Cell::new(None),
                listened: Cell::new(false),
                running: Cell::new(false),
                stop_signal: Notify::new(),
                drained: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakRawServer {
        WeakRawServer {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn handle(&self) -> RawServerHandle {
        RawServerHandle {
            remote: Arc::clone(&self.inner.remote),
        }
    }

    /// Outbound attempts in flight, keyed by destination IP.
    pub fn pending_connections(&self) -> &PendingConnections {
        &self.inner.remote.pending
    }

    fn assert_owner(&self) {
        if let Some(owner) = self.inner.owner.get() {
            debug_assert_eq!(
                owner,
                thread::current().id(),
                "RawServer used from a thread other than its owner"
            );
        }
    }

    /// Bind the server to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the server was already associated with a thread.
    pub fn associate_thread(&self) {
        assert!(
            self.inner.owner.get().is_none(),
            "RawServer has already been associated with a thread"
        );
        self.inner.owner.set(Some(thread::current().id()));
    }

    /// Run `task` on the scheduler thread after `delay`.
    pub fn add_task<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + 'static,
    {
        self.assert_owner();
        self.inner.tasks.schedule(delay, task)
    }

    /// See [`RawServerHandle::external_add_task`].
    pub fn external_add_task<F>(&self, delay: Duration, task: F) -> ExternalTaskHandle
    where
        F: FnOnce(&RawServer) + Send + 'static,
    {
        self.handle().external_add_task(delay, task)
    }

    /// Number of scheduled tasks waiting to run.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Run the tasks that are due now without entering the event loop.
    #[cfg(test)]
    pub(crate) fn run_due_tasks(&self) -> usize {
        self.inner.tasks.run_due(std::time::Instant::now())
    }

    pub fn create_serversocket(&self, port: u16, bind: Option<IpAddr>, tos: u32) -> Result<ListeningSocket> {
        let socket = ListeningSocket::tcp(port, bind, tos)?;
        debug!("created server socket {socket:?}");
        Ok(socket)
    }

    #[cfg(unix)]
    pub fn create_unixserversocket(&self, path: impl AsRef<std::path::Path>) -> Result<ListeningSocket> {
        ListeningSocket::unix(path.as_ref())
    }

    pub fn create_udpsocket(&self, port: u16, bind: Option<IpAddr>, tos: u32) -> Result<ListeningSocket> {
        self.create_datagram_socket(SocketKind::Udp, port, bind, tos)
    }

    pub fn create_multicastsocket(&self, port: u16, bind: Option<IpAddr>, tos: u32) -> Result<ListeningSocket> {
        self.create_datagram_socket(SocketKind::Multicast, port, bind, tos)
    }

    fn create_datagram_socket(
        &self,
        kind: SocketKind,
        port: u16,
        bind: Option<IpAddr>,
        tos: u32,
    ) -> Result<ListeningSocket> {
        let addr = SocketAddr::new(bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        let socket = bind_udp(addr, kind)?;
        let local_addr = socket.local_addr()?;
        let transport = Rc::new(DatagramTransport::new(kind));
        transport.attach_socket(self.register_udp(socket)?);

        let conn = Connection::new(self, kind, None, None, tos);
        let binding = TransportBinding::new(self, &conn, None);
        conn.attach_transport(
            Rc::clone(&transport) as Rc<dyn Transport>,
            binding,
            self.config().write_strategy,
        );
        Ok(ListeningSocket::datagram(
            kind,
            port,
            bind,
            tos,
            local_addr,
            DatagramEndpoint {
                connection: conn,
                transport,
            },
        ))
    }

    fn register_udp(&self, socket: std::net::UdpSocket) -> Result<tokio::net::UdpSocket> {
        let _guard = self.inner.runtime.enter();
        Ok(tokio::net::UdpSocket::from_std(socket)?)
    }

    /// Route inbound connections on `socket` to `handler`, then start
    /// accepting.
    pub fn start_listening(
        &self,
        socket: &ListeningSocket,
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
    ) -> Result<()> {
        self.assert_owner();
        let key = socket
            .key()
            .ok_or_else(|| Error::InvalidState(format!("{:?} sockets use start_listening_udp", socket.kind())))?;
        if socket.set_registered(true) {
            self.inner.factory.pop_inbound(&key);
        }
        self.inner.factory.add_inbound(
            key.clone(),
            ListenerBinding {
                handler,
                context,
                tos: socket.tos(),
            },
        );
        if socket.is_listening() {
            return Ok(());
        }
        socket.prepare()?;
        socket.begin();
        info!("listening on {key:?}");
        self.inner.local.spawn_local(socket.serve(self.downgrade(), key));
        Ok(())
    }

    /// Stop accepting on `socket` and release it. Inbound connections
    /// already accepted are unaffected.
    pub fn stop_listening(&self, socket: &ListeningSocket) {
        self.assert_owner();
        if socket.halt() {
            info!("stopped listening on {socket:?}");
        }
        if socket.set_registered(false) {
            if let Some(key) = socket.key() {
                self.inner.factory.pop_inbound(&key);
            }
        }
    }

    /// Bind a datagram socket's connection to `handler` and start
    /// receiving.
    pub fn start_listening_udp(
        &self,
        socket: &ListeningSocket,
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
    ) -> Result<()> {
        self.assert_owner();
        let endpoint = socket
            .endpoint()
            .ok_or_else(|| Error::InvalidState(format!("{:?} socket is not a datagram socket", socket.kind())))?;
        let conn = endpoint.connection.clone();
        conn.post_init(handler, context);
        self.register_connection(&conn);
        self.inner.udp_sockets.borrow_mut().insert(conn.id(), conn.clone());

        if !socket.begin() {
            return Ok(());
        }
        if !endpoint.transport.is_listening() {
            let fresh = self.register_udp(socket.rebind_datagram()?)?;
            endpoint.transport.attach_socket(fresh);
            conn.refresh_address();
        }
        let binding = conn
            .binding()
            .ok_or_else(|| Error::InvalidState(format!("{conn} has been cleaned up")))?;
        self.inner.local.spawn_local(
            endpoint
                .transport
                .receive(binding, self.config().read_buffer_size),
        );
        info!("receiving datagrams on {:?}", socket.local_addr());
        Ok(())
    }

    pub fn start_listening_multicast(
        &self,
        socket: &ListeningSocket,
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
    ) -> Result<()> {
        self.start_listening_udp(socket, handler, context)
    }

    /// Stop receiving on a datagram socket and forget its connection.
    pub fn stop_listening_udp(&self, socket: &ListeningSocket) {
        self.stop_listening(socket);
        if let Some(conn) = socket.connection() {
            self.inner.udp_sockets.borrow_mut().remove(&conn.id());
            self.inner.connections.borrow_mut().remove(&conn.id());
        }
    }

    pub fn stop_listening_multicast(&self, socket: &ListeningSocket) {
        self.stop_listening_udp(socket);
    }

    /// Start an outbound connection unless the pending-connection ceiling
    /// is reached.
    ///
    /// Returns `Ok(None)` when admission control declines the attempt. A
    /// destination IP that already has an attempt in flight is always
    /// admitted.
    pub fn start_connection(
        &self,
        dns: (&str, u16),
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
        do_bind: bool,
    ) -> Result<Option<Connection>> {
        self.assert_owner();
        let addr = resolve(dns)?;
        if !self
            .inner
            .remote
            .pending
            .try_admit(addr.ip(), self.config().max_incomplete)
        {
            debug!("too many pending connections, not connecting to {addr}");
            return Ok(None);
        }
        Ok(Some(self.launch_connection(addr, handler, context, do_bind)))
    }

    /// Start an outbound connection regardless of the pending-connection
    /// ceiling.
    pub fn force_start_connection(
        &self,
        dns: (&str, u16),
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
        do_bind: bool,
    ) -> Result<Connection> {
        self.assert_owner();
        let addr = resolve(dns)?;
        self.inner.remote.pending.add(addr.ip());
        Ok(self.launch_connection(addr, handler, context, do_bind))
    }

    fn launch_connection(
        &self,
        addr: SocketAddr,
        handler: Rc<dyn Handler>,
        context: Option<Rc<dyn Context>>,
        do_bind: bool,
    ) -> Connection {
        let conn = Connection::outbound(self, addr, handler, context, self.config().tos);
        self.inner.factory.add_outbound(addr, conn.clone());
        self.register_connection(&conn);
        let bind = if do_bind { self.config().bind } else { None };
        debug!("connecting to {addr}");
        self.inner.local.spawn_local(connect(
            self.downgrade(),
            addr,
            bind,
            self.config().connect_timeout,
        ));
        conn
    }

    fn outbound_connected(&self, addr: SocketAddr, stream: TcpStream) {
        let Some(conn) = self.inner.factory.client_connection_made(self, addr) else {
            return;
        };
        if conn.is_dying() || !conn.is_accepting() {
            debug!("{conn} was closed while connecting");
            drop(stream);
            self.remove_socket(&conn);
            return;
        }
        self.establish(&conn, stream);
    }

    /// Add `conn` to the live set.
    pub(crate) fn register_connection(&self, conn: &Connection) {
        self.inner.connections.borrow_mut().insert(conn.id(), conn.clone());
    }

    /// Wrap a stream accepted on the listener registered under `key`.
    pub(crate) fn adopt_inbound<S: ReadyStream>(&self, key: &ListenKey, stream: S) {
        if self.inner.remote.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(binding) = self.inner.factory.get_inbound(key) else {
            debug!("no handler registered for {key:?}, dropping inbound connection");
            return;
        };
        let conn = Connection::new(
            self,
            stream.kind(),
            Some(binding.handler),
            binding.context,
            binding.tos,
        );
        self.register_connection(&conn);
        self.establish(&conn, stream);
    }

    fn establish<S: ReadyStream>(&self, conn: &Connection, stream: S) {
        let transport = Rc::new(StreamTransport::new(stream));
        let binding = TransportBinding::new(self, conn, self.config().idle_timeout());
        conn.attach_transport(
            Rc::clone(&transport) as Rc<dyn Transport>,
            Rc::clone(&binding),
            self.config().write_strategy,
        );
        self.inner.local.spawn_local(
            transport.run(Rc::clone(&binding) as Rc<dyn Protocol>, self.config().read_buffer_size),
        );
        debug!("{conn} established");
        binding.connection_made();
    }

    /// Invoke handler code, isolating any error or panic it raises.
    ///
    /// Faults are reported to the connection's context, read after the call
    /// since the callback may have changed it. Without a context they are
    /// logged.
    pub(crate) fn make_wrapped_call<F>(&self, callable: &'static str, conn: Option<&Connection>, f: F)
    where
        F: FnOnce() -> HandlerResult,
    {
        wrapped_call(callable, conn, self.config().noisy, f);
    }

    /// Release a connection whose transport is gone. Runs at most once per
    /// connection.
    pub(crate) fn remove_socket(&self, conn: &Connection) {
        if !conn.mark_removed() {
            return;
        }
        if !conn.is_dying() {
            if let Some(handler) = conn.handler() {
                self.make_wrapped_call("connection_lost", Some(conn), || handler.connection_lost(conn));
            }
        }
        conn.cleanup();
        self.inner.connections.borrow_mut().remove(&conn.id());
        self.inner.udp_sockets.borrow_mut().remove(&conn.id());
        self.inner.drained.notify_one();
    }

    pub(crate) fn factory(&self) -> &ConnectionFactory {
        &self.inner.factory
    }

    /// Run the event loop until `done` is set or `stop` is called.
    ///
    /// After `stop`, established stream connections get up to
    /// `Config::shutdown_grace` to close; any left over are removed
    /// forcibly so every handler still sees its final callback.
    ///
    /// # Panics
    ///
    /// Panics if called more than once, or from inside another tokio
    /// runtime.
    pub fn listen_forever(&self, done: DoneFlag) {
        assert!(
            !self.inner.listened.replace(true),
            "listen_forever() should only be called once per RawServer"
        );
        if self.inner.owner.get().is_none() {
            self.associate_thread();
        }
        *self
            .inner
            .remote
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(done.clone());
        let handle = self.handle();
        done.add_callback(move || handle.request_stop());

        let inner = &self.inner;
        inner.local.spawn_local(Rc::clone(&inner.tasks).drive());
        if let Some(receiver) = inner.receiver.borrow_mut().take() {
            inner.local.spawn_local(drain_remote(receiver, self.downgrade()));
        }

        if inner.remote.shutting_down.load(Ordering::SeqCst) {
            inner.stop_signal.notify_one();
        }
        inner.running.set(true);
        info!("event loop running");
        inner.local.block_on(&inner.runtime, async {
            inner.stop_signal.notified().await;
            let grace = self.config().shutdown_grace;
            let drained = tokio::time::timeout(grace, async {
                while self.live_stream_count() > 0 {
                    inner.drained.notified().await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    "{} connections still open after {grace:?}, removing them",
                    self.live_stream_count()
                );
            }
        });
        inner.running.set(false);

        for conn in self.live_connections() {
            if conn.kind().is_datagram() {
                conn.mark_removed();
                conn.cleanup();
            } else {
                self.remove_socket(&conn);
            }
        }
        inner.connections.borrow_mut().clear();
        inner.udp_sockets.borrow_mut().clear();
        info!("event loop stopped");
    }

    /// Close every connection and stop the event loop.
    ///
    /// Failures closing individual connections are logged and do not stop
    /// the others from closing. Calling this while the loop is not running
    /// only closes connections.
    pub fn stop(&self) {
        self.assert_owner();
        self.inner.remote.shutting_down.store(true, Ordering::SeqCst);
        for conn in self.live_connections() {
            match panic::catch_unwind(AssertUnwindSafe(|| conn.close())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error closing {conn}: {e}"),
                Err(_) => error!("closing {conn} panicked"),
            }
        }
        if self.inner.running.get() {
            self.inner.stop_signal.notify_one();
        }
    }

    /// Install a Ctrl-C handler.
    ///
    /// The first interrupt sets `flag`, or the flag given to
    /// `listen_forever`, from the scheduler thread. Any further interrupt
    /// exits the process immediately.
    pub fn install_sigint_handler(&self, flag: Option<DoneFlag>) -> Result<()> {
        if self.inner.remote.sigint_installed.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "interrupt handler already installed".to_string(),
            ));
        }
        let handle = self.handle();
        let interrupted = AtomicBool::new(false);
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            info!("interrupted, shutting down");
            match flag.clone().or_else(|| handle.done_flag()) {
                Some(flag) => {
                    handle.external_add_task(Duration::ZERO, move |_| flag.set());
                }
                None => handle.request_stop(),
            }
        })
        .map_err(|e| Error::InvalidState(e.to_string()))
    }

    fn live_connections(&self) -> Vec<Connection> {
        self.inner.connections.borrow().values().cloned().collect()
    }

    fn live_stream_count(&self) -> usize {
        self.inner
            .connections
            .borrow()
            .values()
            .filter(|conn| !conn.kind().is_datagram() && conn.is_established())
            .count()
    }

    /// `(ip, port)` of every live connection that has one.
    pub fn remote_endpoints(&self) -> Vec<SocketAddr> {
        self.inner
            .connections
            .borrow()
            .values()
            .filter_map(Connection::peer_addr)
            .collect()
    }

    /// Number of live connections, datagram sockets included.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    pub fn udp_socket_count(&self) -> usize {
        self.inner.udp_sockets.borrow().len()
    }

    pub fn log_connection_summary(&self) {
        let connections = self.inner.connections.borrow();
        let established = connections.values().filter(|c| c.is_established()).count();
        let dying = connections.values().filter(|c| c.is_dying()).count();
        let unflushed = connections.values().filter(|c| !c.is_flushed()).count();
        debug!(
            "connections: {} live ({established} established, {dying} dying, {unflushed} unflushed), {} pending destinations, {} udp, {} outbound attempts",
            connections.len(),
            self.inner.remote.pending.len(),
            self.inner.udp_sockets.borrow().len(),
            self.inner.factory.outbound_len(),
        );
    }
}

/// Fault-isolating call used by the scheduler.
pub(crate) fn wrapped_call<F>(callable: &'static str, conn: Option<&Connection>, noisy: bool, f: F)
where
    F: FnOnce() -> HandlerResult,
{
    let fault = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => Fault::error(callable, err),
        Err(payload) => Fault::panic(callable, payload),
    };
    match conn.and_then(Connection::context) {
        Some(context) => {
            if panic::catch_unwind(AssertUnwindSafe(|| context.got_exception(&fault))).is_err() {
                error!("context panicked while handling: {fault}");
            }
        }
        None if noisy => error!("{fault}"),
        None => debug!("{fault}"),
    }
}

fn resolve((host, port): (&str, u16)) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    warn!("host name {host} passed to start_connection, resolving it synchronously");
    let resolve_err = || Error::Resolve {
        host: host.to_string(),
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| resolve_err())?
        .next()
        .ok_or_else(resolve_err)
}

async fn open_stream(addr: SocketAddr, bind: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(ip) = bind {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    socket.connect(addr).await
}

async fn connect(server: WeakRawServer, addr: SocketAddr, bind: Option<IpAddr>, limit: Duration) {
    {
        let Some(server) = server.upgrade() else {
            return;
        };
        if !server.factory().connection_starting(&server, addr) {
            return;
        }
    }
    let result = tokio::time::timeout(limit, open_stream(addr, bind)).await;
    let Some(server) = server.upgrade() else {
        return;
    };
    match result {
        Ok(Ok(stream)) => server.outbound_connected(addr, stream),
        Ok(Err(e)) => server
            .factory()
            .client_connection_failed(&server, addr, Error::from_connect(addr, e)),
        Err(_) => server
            .factory()
            .client_connection_failed(&server, addr, Error::ConnectTimeout(addr)),
    }
}

async fn drain_remote(mut receiver: mpsc::UnboundedReceiver<RemoteTask>, server: WeakRawServer) {
    while let Some(task) = receiver.recv().await {
        let Some(server) = server.upgrade() else {
            break;
        };
        task(&server);
    }
}
