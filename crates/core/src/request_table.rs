//! Fixed 256-slot table of in-flight requests, indexed by outbound RADIUS
//! identifier (spec §4.2).
//!
//! No direct teacher analogue exists (TURN has no retry/pending-request
//! table of this shape); grounded in *style* on `session::Timer`'s tick
//! counter and `SessionManager`'s background sweep loop, adapted from a
//! sync `thread::spawn` sweep to `tokio::spawn` + `tokio::time::sleep` since
//! the rest of this crate is async.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub const TABLE_CAPACITY: usize = 256;

pub const UDP_RETRY_LIMIT: u32 = 3;
pub const TLS_RETRY_LIMIT: u32 = 1;
pub const REQUEST_TOTAL_EXPIRY: Duration = Duration::from_secs(20);

/// What kind of request occupies a slot, governing retry policy (spec §4.2)
/// and whether its expiry without a reply marks the peer suspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Normal,
    StatusServer,
}

pub struct PendingRequest {
    pub buffer: Vec<u8>,
    pub origin_client: usize,
    pub origin_id: u8,
    pub origin_authenticator: [u8; 16],
    pub origin_address: Option<SocketAddr>,
    pub kind: RequestKind,
    pub tries: u32,
    pub expiry: Instant,
    pub received: bool,
}

struct Slot {
    request: Option<PendingRequest>,
}

/// Per-server table; the slot index IS the outbound RADIUS identifier.
pub struct RequestTable {
    slots: Vec<Slot>,
    next_id: usize,
    retry_limit: u32,
    per_try_interval: Duration,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::with_retry_policy(UDP_RETRY_LIMIT, REQUEST_TOTAL_EXPIRY / UDP_RETRY_LIMIT)
    }

    pub fn with_retry_policy(retry_limit: u32, per_try_interval: Duration) -> Self {
        let mut slots = Vec::with_capacity(TABLE_CAPACITY);
        slots.resize_with(TABLE_CAPACITY, || Slot { request: None });

        Self { slots, next_id: 0, retry_limit, per_try_interval }
    }

    /// Retry policy for a TLS or Status-Server upstream: one attempt, then
    /// the request is dropped (spec §4.2).
    pub fn tls_policy() -> (u32, Duration) {
        (TLS_RETRY_LIMIT, REQUEST_TOTAL_EXPIRY)
    }

    pub fn udp_policy() -> (u32, Duration) {
        (UDP_RETRY_LIMIT, REQUEST_TOTAL_EXPIRY / UDP_RETRY_LIMIT)
    }

    /// Scan from `next_id` forward, then from 0 up to `next_id`, for a free
    /// slot, without occupying it yet. Spec §4.2's operation order needs the
    /// assigned id *before* the Message-Authenticator over the final buffer
    /// is computed, so callers that sign their buffer call this first,
    /// stamp the id into `buffer[1]`, fill the Message-Authenticator, and
    /// only then call [`RequestTable::insert_at`].
    pub fn next_free_id(&self) -> Result<u8> {
        let start = self.next_id;

        for offset in 0..TABLE_CAPACITY {
            let id = (start + offset) % TABLE_CAPACITY;
            if self.slots[id].request.is_none() {
                return Ok(id as u8);
            }
        }

        Err(Error::TableFull)
    }

    /// Store `request` at `id`, previously obtained from
    /// [`RequestTable::next_free_id`], and advance `next_id` past it.
    pub fn insert_at(&mut self, id: u8, request: PendingRequest) {
        self.slots[id as usize].request = Some(request);
        self.next_id = (id as usize + 1) % TABLE_CAPACITY;
    }

    /// Convenience path for callers with no Message-Authenticator to
    /// recompute against the assigned id: reserve a free slot, stamp it
    /// into `request.buffer[1]`, and store it in one step.
    pub fn insert(&mut self, mut request: PendingRequest) -> Result<u8> {
        let id = self.next_free_id()?;
        if request.buffer.len() > 1 {
            request.buffer[1] = id;
        }
        self.insert_at(id, request);
        Ok(id)
    }

    pub fn mark_received(&mut self, id: u8) {
        if let Some(request) = self.slots[id as usize].request.as_mut() {
            request.received = true;
        }
    }

    pub fn lookup(&self, id: u8) -> Option<&PendingRequest> {
        self.slots[id as usize].request.as_ref()
    }

    pub fn lookup_mut(&mut self, id: u8) -> Option<&mut PendingRequest> {
        self.slots[id as usize].request.as_mut()
    }

    /// Duplicate suppression (spec §4.2/§4.4): find an in-flight request
    /// that originated from `client` with the client's own identifier `id`.
    pub fn lookup_by_origin(&self, client: usize, id: u8) -> Option<&PendingRequest> {
        self.slots
            .iter()
            .filter_map(|slot| slot.request.as_ref())
            .find(|request| request.origin_client == client && request.origin_id == id)
    }

    /// Sweep every occupied slot (spec §4.2): free received or exhausted
    /// requests, retransmit the rest. Returns the buffers that need
    /// retransmission (kind, buffer) plus the deadline the caller should
    /// next wake at, and whether any Status-Server request died (peer
    /// should be marked suspect).
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut retransmit = Vec::new();
        let mut next_wakeup = None;
        let mut status_server_suspect = false;

        for slot in self.slots.iter_mut() {
            let Some(request) = slot.request.as_mut() else { continue };

            if request.received {
                slot.request = None;
                continue;
            }

            if now < request.expiry {
                next_wakeup = Some(match next_wakeup {
                    Some(existing) => std::cmp::min(existing, request.expiry),
                    None => request.expiry,
                });
                continue;
            }

            let limit = if request.kind == RequestKind::StatusServer { TLS_RETRY_LIMIT } else { self.retry_limit };

            if request.tries >= limit {
                if request.kind == RequestKind::StatusServer {
                    status_server_suspect = true;
                }
                slot.request = None;
                continue;
            }

            request.tries += 1;
            request.expiry = now + self.per_try_interval;
            retransmit.push(request.buffer.clone());
            next_wakeup = Some(match next_wakeup {
                Some(existing) => std::cmp::min(existing, request.expiry),
                None => request.expiry,
            });
        }

        SweepOutcome { retransmit, next_wakeup, status_server_suspect }
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SweepOutcome {
    pub retransmit: Vec<Vec<u8>>,
    pub next_wakeup: Option<Instant>,
    pub status_server_suspect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_request(origin_client: usize, origin_id: u8) -> PendingRequest {
        PendingRequest {
            buffer: vec![1, 0, 0, 20],
            origin_client,
            origin_id,
            origin_authenticator: [0u8; 16],
            origin_address: None,
            kind: RequestKind::Normal,
            tries: 0,
            expiry: Instant::now() + Duration::from_secs(7),
            received: false,
        }
    }

    #[test]
    fn insert_never_reuses_an_occupied_slot() {
        let mut table = RequestTable::new();
        let mut ids = Vec::new();

        for client_id in 0..TABLE_CAPACITY {
            let id = table.insert(dummy_request(client_id, 0)).unwrap();
            ids.push(id);
        }

        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), TABLE_CAPACITY);
    }

    #[test]
    fn the_257th_insert_without_responses_is_full() {
        let mut table = RequestTable::new();
        for client_id in 0..TABLE_CAPACITY {
            table.insert(dummy_request(client_id, 0)).unwrap();
        }

        let result = table.insert(dummy_request(9999, 0));
        assert!(matches!(result, Err(Error::TableFull)));
    }

    #[test]
    fn received_slots_are_freed_on_sweep() {
        let mut table = RequestTable::new();
        let id = table.insert(dummy_request(1, 5)).unwrap();
        table.mark_received(id);

        table.sweep(Instant::now());
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn lookup_by_origin_finds_the_in_flight_duplicate() {
        let mut table = RequestTable::new();
        table.insert(dummy_request(7, 200)).unwrap();

        assert!(table.lookup_by_origin(7, 200).is_some());
        assert!(table.lookup_by_origin(7, 201).is_none());
    }
}
