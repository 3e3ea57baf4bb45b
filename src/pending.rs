//! Pending outbound connection registry
//!
//! Counts outbound attempts in flight per destination IP. This is the only
//! scheduler structure touched from arbitrary threads, so it sits behind a
//! mutex that is never held across a blocking call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-destination counters of unresolved outbound connections.
///
/// Counts never go below zero and IPs whose count reaches zero are removed,
/// so `len()` is the number of distinct destinations with an attempt in
/// flight.
#[derive(Debug, Default)]
pub struct PendingConnections {
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl PendingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one more attempt to `ip`, unconditionally.
    pub fn add(&self, ip: IpAddr) {
        *self.lock().entry(ip).or_insert(0) += 1;
    }

    /// Record that one attempt to `ip` resolved.
    pub fn remove(&self, ip: IpAddr) {
        let mut counts = self.lock();
        if let Some(count) = counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }

    /// Admission check and registration in one step.
    ///
    /// Refuses when `max_incomplete` distinct destinations are already
    /// pending and `ip` is not one of them. An IP that already has an attempt
    /// in flight is always admitted.
    pub fn try_admit(&self, ip: IpAddr, max_incomplete: usize) -> bool {
        let mut counts = self.lock();
        if counts.len() >= max_incomplete && !counts.contains_key(&ip) {
            return false;
        }
        *counts.entry(ip).or_insert(0) += 1;
        true
    }

    /// Number of distinct destinations with an attempt in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count(&self, ip: IpAddr) -> usize {
        self.lock().get(&ip).copied().unwrap_or(0)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.lock().contains_key(&ip)
    }
}
