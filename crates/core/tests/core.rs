use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use radsecproxy_core::peer::{ClientConfig, ClientPeer, ServerConfig, ServerPeer, Transport};
use radsecproxy_core::realm::{Realm, RealmRouter};
use radsecproxy_core::registry::Registry;
use radsecproxy_core::request_table::{PendingRequest, RequestKind};

fn any_loopback_addr() -> SocketAddr {
    let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

#[test]
fn registry_matches_client_by_udp_source_address() {
    let client_addr = any_loopback_addr();
    let client = ClientPeer::new(ClientConfig {
        name: "client-a".into(),
        transport: Transport::Udp,
        addresses: vec![client_addr],
        secret: b"testing123".to_vec(),
    });

    let registry = Registry::new(vec![client], vec![], RealmRouter::new(vec![]));

    let (id, matched) = registry.client_by_udp_source(client_addr).unwrap();
    assert_eq!(id, 0);
    assert_eq!(matched.config.name, "client-a");

    assert!(registry.client_by_udp_source(any_loopback_addr()).is_none());
}

#[test]
fn realm_router_directs_to_the_configured_server_and_rejects_unmatched() {
    let server = Arc::new(ServerPeer::new(
        ServerConfig {
            name: "upstream".into(),
            transport: Transport::Udp,
            addresses: vec![any_loopback_addr()],
            secret: b"testing123".to_vec(),
            status_server: false,
        },
        None,
    ));

    let realm = Realm::compile("example.com", Some(server.clone()), None).unwrap();
    let router = RealmRouter::new(vec![realm]);

    let matched = router.match_username("alice@example.com").unwrap();
    assert!(matched.server.is_some());
    assert!(router.match_username("alice@other.net").is_none());
}

#[tokio::test]
async fn request_table_insert_sweep_and_duplicate_lookup_round_trip() {
    let server = ServerPeer::new(
        ServerConfig {
            name: "upstream".into(),
            transport: Transport::Udp,
            addresses: vec![any_loopback_addr()],
            secret: b"testing123".to_vec(),
            status_server: false,
        },
        None,
    );

    let request = PendingRequest {
        buffer: vec![1, 0, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        origin_client: 0,
        origin_id: 17,
        origin_authenticator: [0u8; 16],
        origin_address: Some(any_loopback_addr()),
        kind: RequestKind::Normal,
        tries: 0,
        expiry: Instant::now() + Duration::from_secs(7),
        received: false,
    };

    let id;
    {
        let mut table = server.table.lock().await;
        id = table.insert(request).unwrap();
        assert!(table.lookup_by_origin(0, 17).is_some());
    }

    {
        let mut table = server.table.lock().await;
        table.mark_received(id);
    }

    let outcome = server.table.lock().await.sweep(Instant::now());
    assert!(outcome.retransmit.is_empty());

    assert!(server.table.lock().await.lookup(id).is_none());
}
