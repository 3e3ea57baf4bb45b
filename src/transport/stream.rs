//! Stream transport for TCP and Unix domain sockets
//!
//! Reading and writing share one socket through readiness notifications, so
//! a single task serves both directions and can observe every close request
//! between two I/O operations.

use super::{Protocol, Transport};
use crate::buffer::Producer;
use crate::{Address, Result, SocketKind};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use log::debug;
use socket2::SockRef;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Upper bound on chunks handed to one vectored write.
const MAX_IOVECS: usize = 64;

/// A socket usable through readiness-based non-blocking calls.
#[async_trait(?Send)]
pub(crate) trait ReadyStream: 'static {
    fn kind(&self) -> SocketKind;

    async fn readable(&self) -> io::Result<()>;

    async fn writable(&self) -> io::Result<()>;

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    fn sock_ref(&self) -> SockRef<'_>;

    fn peer(&self) -> Option<Address>;

    fn host(&self) -> Option<Address>;
}

#[async_trait(?Send)]
impl ReadyStream for TcpStream {
    fn kind(&self) -> SocketKind {
        SocketKind::Tcp
    }

    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        TcpStream::try_write_vectored(self, bufs)
    }

    fn sock_ref(&self) -> SockRef<'_> {
        SockRef::from(self)
    }

    fn peer(&self) -> Option<Address> {
        self.peer_addr().ok().map(Address::Inet)
    }

    fn host(&self) -> Option<Address> {
        self.local_addr().ok().map(Address::Inet)
    }
}

#[cfg(unix)]
#[async_trait(?Send)]
impl ReadyStream for tokio::net::UnixStream {
    fn kind(&self) -> SocketKind {
        SocketKind::Unix
    }

    async fn readable(&self) -> io::Result<()> {
        tokio::net::UnixStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        tokio::net::UnixStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_read(self, buf)
    }

    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        tokio::net::UnixStream::try_write_vectored(self, bufs)
    }

    fn sock_ref(&self) -> SockRef<'_> {
        SockRef::from(self)
    }

    fn peer(&self) -> Option<Address> {
        self.peer_addr()
            .ok()
            .map(|addr| Address::Unix(addr.as_pathname().map(Into::into)))
    }

    fn host(&self) -> Option<Address> {
        self.local_addr()
            .ok()
            .map(|addr| Address::Unix(addr.as_pathname().map(Into::into)))
    }
}

struct StreamShared<S> {
    io: S,
    outbound: RefCell<VecDeque<Bytes>>,
    producer: RefCell<Option<Weak<dyn Producer>>>,
    buffer_callback: RefCell<Option<Rc<dyn Fn()>>>,
    wake: Notify,
    paused: Cell<bool>,
    read_stopped: Cell<bool>,
    disconnecting: Cell<bool>,
    write_close_pending: Cell<bool>,
    write_closed: Cell<bool>,
}

impl<S: ReadyStream> StreamShared<S> {
    /// Refill the send queue from a registered producer once it is empty.
    fn pull_from_producer(&self) {
        if self.write_closed.get() || !self.outbound.borrow().is_empty() {
            return;
        }
        let producer = self.producer.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(producer) = producer {
            producer.resume_producing();
        }
    }

    /// One non-blocking vectored write of the queue head.
    fn flush_some(&self) -> io::Result<()> {
        let drained = {
            let mut outbound = self.outbound.borrow_mut();
            let result = {
                let slices: Vec<IoSlice<'_>> = outbound
                    .iter()
                    .take(MAX_IOVECS)
                    .map(|chunk| IoSlice::new(chunk))
                    .collect();
                self.io.try_write_vectored(&slices)
            };
            let mut written = match result {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };
            while written > 0 {
                let Some(front) = outbound.front_mut() else {
                    break;
                };
                if front.len() <= written {
                    written -= front.len();
                    outbound.pop_front();
                } else {
                    front.advance(written);
                    written = 0;
                }
            }
            outbound.is_empty()
        };
        if drained {
            let callback = self.buffer_callback.borrow().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        Ok(())
    }

    fn finish(&self) {
        self.outbound.borrow_mut().clear();
        self.producer.borrow_mut().take();
        self.buffer_callback.borrow_mut().take();
        self.disconnecting.set(true);
    }
}

/// Transport over a connected stream socket.
pub(crate) struct StreamTransport<S> {
    shared: Rc<StreamShared<S>>,
}

impl<S: ReadyStream> StreamTransport<S> {
    pub(crate) fn new(io: S) -> Self {
        Self {
            shared: Rc::new(StreamShared {
                io,
                outbound: RefCell::new(VecDeque::new()),
                producer: RefCell::new(None),
                buffer_callback: RefCell::new(None),
                wake: Notify::new(),
                paused: Cell::new(false),
                read_stopped: Cell::new(false),
                disconnecting: Cell::new(false),
                write_close_pending: Cell::new(false),
                write_closed: Cell::new(false),
            }),
        }
    }

    /// The task serving this socket until it closes.
    pub(crate) fn run(&self, protocol: Rc<dyn Protocol>, read_size: usize) -> impl Future<Output = ()> + 'static {
        let shared = Rc::clone(&self.shared);
        async move {
            let mut buf = vec![0u8; read_size];
            let reason = loop {
                shared.pull_from_producer();
                if shared.outbound.borrow().is_empty() {
                    if shared.disconnecting.get() {
                        break None;
                    }
                    if shared.write_close_pending.replace(false) {
                        if let Err(e) = shared.io.sock_ref().shutdown(Shutdown::Write) {
                            debug!("half-close failed: {e}");
                        }
                        shared.write_closed.set(true);
                    }
                }
                let want_read = !shared.paused.get()
                    && !shared.read_stopped.get()
                    && !shared.disconnecting.get();
                let want_write = !shared.write_closed.get() && !shared.outbound.borrow().is_empty();

                tokio::select! {
                    biased;
                    _ = shared.wake.notified() => {}
                    ready = shared.io.writable(), if want_write => {
                        if let Err(e) = ready.and_then(|()| shared.flush_some()) {
                            break Some(e);
                        }
                    }
                    ready = shared.io.readable(), if want_read => {
                        if let Err(e) = ready {
                            break Some(e);
                        }
                        // Paused or stopped while this branch was armed
                        if shared.paused.get() || shared.read_stopped.get() {
                            continue;
                        }
                        match shared.io.try_read(&mut buf) {
                            Ok(0) => break None,
                            Ok(n) => protocol.data_received(Bytes::copy_from_slice(&buf[..n])),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                            Err(e) => break Some(e),
                        }
                    }
                }
            };
            shared.finish();
            protocol.connection_lost(reason);
        }
    }
}

impl<S: ReadyStream> Transport for StreamTransport<S> {
    fn kind(&self) -> SocketKind {
        self.shared.io.kind()
    }

    fn peer(&self) -> Option<Address> {
        self.shared.io.peer()
    }

    fn host(&self) -> Option<Address> {
        self.shared.io.host()
    }

    fn write(&self, chunk: Bytes) -> io::Result<()> {
        if self.shared.disconnecting.get() || self.shared.write_closed.get() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write after close",
            ));
        }
        if !chunk.is_empty() {
            self.shared.outbound.borrow_mut().push_back(chunk);
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    fn register_producer(&self, producer: Weak<dyn Producer>) {
        *self.shared.producer.borrow_mut() = Some(producer);
        self.shared.wake.notify_one();
    }

    fn unregister_producer(&self) {
        self.shared.producer.borrow_mut().take();
    }

    fn add_buffer_callback(&self, callback: Box<dyn Fn()>) -> bool {
        *self.shared.buffer_callback.borrow_mut() = Some(Rc::from(callback));
        true
    }

    fn pause_producing(&self) -> Result<()> {
        if !self.shared.paused.replace(true) {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    fn resume_producing(&self) -> Result<()> {
        self.shared.paused.set(false);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn lose_connection(&self) -> Result<()> {
        if !self.shared.disconnecting.replace(true) {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    fn lose_write_connection(&self) -> Result<()> {
        if !self.shared.write_closed.get() {
            self.shared.write_close_pending.set(true);
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    fn stop_reading(&self) -> Result<()> {
        if !self.shared.read_stopped.replace(true) {
            if let Err(e) = self.shared.io.sock_ref().shutdown(Shutdown::Read) {
                debug!("read shutdown failed: {e}");
            }
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    fn set_tos(&self, tos: u32) -> io::Result<()> {
        self.shared.io.sock_ref().set_tos(tos)
    }

    fn set_linger_reset(&self) -> io::Result<()> {
        self.shared.io.sock_ref().set_linger(Some(Duration::ZERO))
    }

    fn shutdown_raw(&self, how: Shutdown) -> io::Result<()> {
        self.shared.io.sock_ref().shutdown(how)
    }
}
