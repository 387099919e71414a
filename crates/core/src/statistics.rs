//! Per-peer counters, grounded on the teacher's `Counts`/`Statistics` shape.
//! The only counter type this proxy ever needs is `u64`, so `Counts` is a
//! plain struct rather than generic over a `Number` trait.
//!
//! These have no wire effect; they exist for operational visibility and so
//! integration tests can assert "exactly one packet went where I expect".

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

/// A peer identity used as a statistics-table key: its configured name,
/// since a `ServerPeer` is often reached through a `Realm` rather than a
/// registry index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerId {
    Client(String),
    Server(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub received_bytes: u64,
    pub received_pkts: u64,
    pub send_bytes: u64,
    pub send_pkts: u64,
    pub error_pkts: u64,
}

impl Counts {
    fn add_received(&mut self, bytes: usize) {
        self.received_bytes += bytes as u64;
        self.received_pkts += 1;
    }

    fn add_sent(&mut self, bytes: usize) {
        self.send_bytes += bytes as u64;
        self.send_pkts += 1;
    }

    fn add_error(&mut self) {
        self.error_pkts += 1;
    }
}

/// Shared table of per-peer counters. Cloning shares the underlying table
/// (it is an `Arc<RwLock<_>>` handle, matching `turn-server/src/statistics.rs`).
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    inner: Arc<RwLock<AHashMap<PeerId, Counts>>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, peer: PeerId, bytes: usize) {
        self.inner.write().entry(peer).or_default().add_received(bytes);
    }

    pub fn record_sent(&self, peer: PeerId, bytes: usize) {
        self.inner.write().entry(peer).or_default().add_sent(bytes);
    }

    pub fn record_error(&self, peer: PeerId) {
        self.inner.write().entry(peer).or_default().add_error();
    }

    pub fn snapshot(&self, peer: PeerId) -> Counts {
        self.inner.read().get(&peer).copied().unwrap_or_default()
    }
}
