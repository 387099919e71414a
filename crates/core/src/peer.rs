//! Configured peer identities: the client and server sides of a proxied
//! RADIUS exchange.
//!
//! Grounded on `crates/service/src/session/mod.rs`'s pre-sized table wrapper
//! and `Arc`-shared, read-only-after-startup config shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::request_table::RequestTable;
use crate::tls::TlsSession;

/// Transport a peer speaks. `Tls` carries the name of the `TLS { }` config
/// block supplying certificates (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tls { tls_config: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: Transport,
    pub addresses: Vec<SocketAddr>,
    pub secret: Vec<u8>,
    pub status_server: bool,
}

/// An upstream RADIUS server this proxy forwards requests to.
///
/// Owns its [`RequestTable`] and transport handle exclusively; a
/// `PendingRequest` refers to its originating [`ClientPeer`] by id, never by
/// ownership, per spec §3's "Ownership summary".
pub struct ServerPeer {
    pub config: ServerConfig,
    pub table: Mutex<RequestTable>,
    pub newrq_signal: Notify,
    pub tls: Option<Mutex<TlsSession>>,
    pub udp_socket: Option<Arc<UdpSocket>>,
    pub udp_connected_addr: std::sync::RwLock<Option<SocketAddr>>,
    last_connect_attempt: AtomicI64,
    connection_ok: AtomicBool,
}

impl ServerPeer {
    pub fn new(config: ServerConfig, udp_socket: Option<Arc<UdpSocket>>) -> Self {
        let tls = match &config.transport {
            Transport::Tls { .. } => Some(Mutex::new(TlsSession::new())),
            Transport::Udp => None,
        };

        let table = match &config.transport {
            Transport::Udp => {
                let (limit, interval) = RequestTable::udp_policy();
                RequestTable::with_retry_policy(limit, interval)
            }
            Transport::Tls { .. } => {
                let (limit, interval) = RequestTable::tls_policy();
                RequestTable::with_retry_policy(limit, interval)
            }
        };

        Self {
            config,
            table: Mutex::new(table),
            newrq_signal: Notify::new(),
            tls,
            udp_socket,
            udp_connected_addr: std::sync::RwLock::new(None),
            last_connect_attempt: AtomicI64::new(0),
            connection_ok: AtomicBool::new(false),
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.config.transport, Transport::Udp)
    }

    pub fn connection_ok(&self) -> bool {
        self.connection_ok.load(Ordering::Acquire)
    }

    pub fn set_connection_ok(&self, ok: bool) {
        self.connection_ok.store(ok, Ordering::Release);
    }

    pub fn last_connect_attempt_unix_ms(&self) -> i64 {
        self.last_connect_attempt.load(Ordering::Acquire)
    }

    pub fn set_last_connect_attempt_unix_ms(&self, value: i64) {
        self.last_connect_attempt.store(value, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub transport: Transport,
    pub addresses: Vec<SocketAddr>,
    pub secret: Vec<u8>,
}

/// Queued reply: fully signed outbound bytes plus, for UDP clients, the
/// destination address (TLS clients have a single active connection).
pub struct QueuedReply {
    pub buffer: Vec<u8>,
    pub dest_addr: Option<SocketAddr>,
}

/// A configured downstream RADIUS client this proxy accepts requests from.
///
/// `reply_rx` is only ever drained by a per-client task, so it is `None` for
/// UDP clients: those share one outbound writer (below), and `reply_tx` is a
/// clone of that writer's channel rather than a private one.
pub struct ClientPeer {
    pub config: ClientConfig,
    pub reply_tx: mpsc::Sender<QueuedReply>,
    pub reply_rx: Option<Mutex<mpsc::Receiver<QueuedReply>>>,
    /// Guards against a second simultaneous inbound TLS connection from the
    /// same peer (spec §4.5): only meaningful for `Transport::Tls` clients.
    pub tls_connected: AtomicBool,
}

/// Bound of a TLS client's private reply queue, and the per-client share of
/// the shared UDP reply queue's aggregate bound (spec §4.6: "clients_count *
/// 256").
pub const REPLY_QUEUE_CAPACITY: usize = 256;

impl ClientPeer {
    /// TLS client: owns a private reply queue, drained by the task running
    /// that client's connection.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        Arc::new(Self { config, reply_tx, reply_rx: Some(Mutex::new(reply_rx)), tls_connected: AtomicBool::new(false) })
    }

    /// UDP client: `reply_tx` is a clone of the one shared channel every
    /// UDP-transport client feeds, built by [`udp_reply_channel`]; there is
    /// no private `reply_rx` to drain.
    pub fn new_udp(config: ClientConfig, reply_tx: mpsc::Sender<QueuedReply>) -> Arc<Self> {
        Arc::new(Self { config, reply_tx, reply_rx: None, tls_connected: AtomicBool::new(false) })
    }
}

/// Build the one shared reply channel every UDP-transport client's
/// `reply_tx` is cloned from, sized to the aggregate bound of
/// `udp_client_count * REPLY_QUEUE_CAPACITY`. A single task drains the
/// returned receiver and owns the shared UDP writer socket (spec §5: "one
/// shared UDP writer for all UDP clients").
pub fn udp_reply_channel(udp_client_count: usize) -> (mpsc::Sender<QueuedReply>, mpsc::Receiver<QueuedReply>) {
    mpsc::channel(REPLY_QUEUE_CAPACITY * udp_client_count.max(1))
}
