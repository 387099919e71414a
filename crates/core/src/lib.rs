//! ## Peer session and transport layer
//!
//! Owns the parts of the proxy that sit above the wire codec: configured
//! peer identities, realm routing, the per-server pending-request table,
//! the upstream sender/receiver task pair, the downstream listener/replier
//! task pair, and the TLS transport state machine.

pub mod client;
pub mod error;
pub mod peer;
pub mod realm;
pub mod registry;
pub mod request_table;
pub mod server;
pub mod statistics;
pub mod tls;

pub use error::{Error, Result};
pub use peer::{ClientConfig, ClientPeer, ServerConfig, ServerPeer, Transport};
pub use realm::{Realm, RealmRouter};
pub use registry::Registry;
pub use request_table::{PendingRequest, RequestTable};
pub use statistics::Statistics;
