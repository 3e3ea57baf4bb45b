//! Correlation of socket events with the connections that requested them
//!
//! Outbound attempts are keyed by destination address, inbound listeners by
//! their listen key. A key may hold several entries; they are served in
//! the order they were registered.

use crate::{Connection, Context, Error, Handler, ListenKey, RawServer};
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::SocketAddr;
use std::rc::Rc;

/// Map from a key to a FIFO row of values.
#[derive(Debug)]
pub(crate) struct MultiMap<K, V> {
    rows: HashMap<K, VecDeque<V>>,
}

impl<K: Eq + Hash, V> MultiMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    pub(crate) fn push_to_row(&mut self, key: K, value: V) {
        self.rows.entry(key).or_default().push_back(value);
    }

    /// Oldest value in the row for `key`.
    pub(crate) fn get_from_row(&self, key: &K) -> Option<&V> {
        self.rows.get(key).and_then(VecDeque::front)
    }

    /// Remove and return the oldest value for `key`. Empty rows are dropped.
    pub(crate) fn pop_from_row(&mut self, key: &K) -> Option<V> {
        let row = self.rows.get_mut(key)?;
        let value = row.pop_front();
        if row.is_empty() {
            self.rows.remove(key);
        }
        value
    }

    /// Total number of values across all rows.
    pub(crate) fn len(&self) -> usize {
        self.rows.values().map(VecDeque::len).sum()
    }
}

impl<K: Eq + Hash, V> Default for MultiMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a listening socket hands to every connection it accepts
#[derive(Clone)]
pub(crate) struct ListenerBinding {
    pub(crate) handler: Rc<dyn Handler>,
    pub(crate) context: Option<Rc<dyn Context>>,
    pub(crate) tos: u32,
}

/// Pending outbound connections and inbound listener bindings.
#[derive(Default)]
pub(crate) struct ConnectionFactory {
    outbound: RefCell<MultiMap<SocketAddr, Connection>>,
    inbound: RefCell<MultiMap<ListenKey, ListenerBinding>>,
}

impl ConnectionFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_outbound(&self, addr: SocketAddr, conn: Connection) {
        self.outbound.borrow_mut().push_to_row(addr, conn);
    }

    pub(crate) fn peek_outbound(&self, addr: SocketAddr) -> Option<Connection> {
        self.outbound.borrow().get_from_row(&addr).cloned()
    }

    pub(crate) fn pop_outbound(&self, addr: SocketAddr) -> Option<Connection> {
        self.outbound.borrow_mut().pop_from_row(&addr)
    }

    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.borrow().len()
    }

    pub(crate) fn add_inbound(&self, key: ListenKey, binding: ListenerBinding) {
        self.inbound.borrow_mut().push_to_row(key, binding);
    }

    pub(crate) fn get_inbound(&self, key: &ListenKey) -> Option<ListenerBinding> {
        self.inbound.borrow().get_from_row(key).cloned()
    }

    pub(crate) fn pop_inbound(&self, key: &ListenKey) -> Option<ListenerBinding> {
        self.inbound.borrow_mut().pop_from_row(key)
    }

    /// Last chance to abandon an outbound attempt before the OS-level
    /// connect is issued. Returns false if the attempt must not proceed.
    pub(crate) fn connection_starting(&self, server: &RawServer, addr: SocketAddr) -> bool {
        let Some(conn) = self.peek_outbound(addr) else {
            return false;
        };
        if conn.is_accepting() {
            return true;
        }
        debug!("abandoning connection to {addr} before it started");
        self.pop_outbound(addr);
        server.pending_connections().remove(addr.ip());
        server.remove_socket(&conn);
        false
    }

    /// The OS-level connect to `addr` failed.
    pub(crate) fn client_connection_failed(&self, server: &RawServer, addr: SocketAddr, reason: Error) {
        let Some(conn) = self.pop_outbound(addr) else {
            return;
        };
        debug!("connection to {addr} failed: {reason}");
        if !conn.is_dying() {
            conn.set_dying();
            if let Some(handler) = conn.handler() {
                server.make_wrapped_call("connection_failed", Some(&conn), || {
                    handler.connection_failed(addr, &reason)
                });
            }
        }
        server.pending_connections().remove(addr.ip());
        server.remove_socket(&conn);
    }

    /// The OS-level connect to `addr` succeeded; hand back the connection
    /// that asked for it.
    pub(crate) fn client_connection_made(&self, server: &RawServer, addr: SocketAddr) -> Option<Connection> {
        let conn = self.pop_outbound(addr)?;
        server.pending_connections().remove(addr.ip());
        Some(conn)
    }
}
