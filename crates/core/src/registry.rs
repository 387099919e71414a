//! Read-only-after-startup peer and realm tables (spec §5: "global
//! peer/realm registries are read-only after startup; no locking
//! required").

use std::net::SocketAddr;
use std::sync::Arc;

use crate::peer::{ClientPeer, ServerPeer};
use crate::realm::RealmRouter;

pub struct Registry {
    pub clients: Vec<Arc<ClientPeer>>,
    pub servers: Vec<Arc<ServerPeer>>,
    pub realms: RealmRouter,
}

impl Registry {
    pub fn new(clients: Vec<Arc<ClientPeer>>, servers: Vec<Arc<ServerPeer>>, realms: RealmRouter) -> Arc<Self> {
        Arc::new(Self { clients, servers, realms })
    }

    pub fn client_by_id(&self, id: usize) -> Option<&Arc<ClientPeer>> {
        self.clients.get(id)
    }

    /// Match an inbound UDP datagram's source address to a configured
    /// client peer (spec §2's PeerRegistry).
    pub fn client_by_udp_source(&self, addr: SocketAddr) -> Option<(usize, &Arc<ClientPeer>)> {
        self.clients
            .iter()
            .enumerate()
            .find(|(_, client)| client.config.addresses.contains(&addr))
    }
}
