//! Startup wiring: parse configuration, load TLS material, build the
//! peer/realm registry, and spawn every long-running task.
//!
//! Grounded on the teacher's `src/lib.rs`: a thin `startup(config)` entry
//! point that builds a `Service`/registry from `Config` and blocks forever,
//! generalized from TURN's single allocation service to a client-table,
//! server-table, and realm-router trio plus one task pair per peer. UDP
//! clients are the exception: they share one reply channel and one writer
//! task bound to the single listening socket, rather than a task per peer.

pub mod config;
pub mod logger;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore, ServerConfig as RustlsServerConfig};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use proxy_core::peer::{ClientConfig as PeerClientConfig, ClientPeer, ServerConfig as PeerServerConfig, ServerPeer, Transport};
use proxy_core::realm::{Realm, RealmRouter};
use proxy_core::registry::Registry;
use proxy_core::statistics::Statistics;
use proxy_core::tls::CommonNameVerifier;
use proxy_core::{client, server};

use config::{Config, ConfigError, TlsContext, TransportKind};

const DEFAULT_RADIUS_PORT: u16 = 1812;
const DEFAULT_RADSEC_PORT: u16 = 2083;

/// Parsed certificate chain, private key, and trusted CA chain for one
/// `TLS { }` block. Kept as raw DER rather than a pre-built
/// `rustls::RootCertStore` so inbound listening can merge CA material from
/// several contexts when clients reference different ones.
struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
}

fn load_tls_material(context: &TlsContext) -> anyhow::Result<TlsMaterial> {
    if context.certificate_key_password.is_some() {
        log::warn!("CertificateKeyPassword is set but encrypted private keys are not supported; attempting to load the key file as-is");
    }

    let cert_bytes = std::fs::read(&context.certificate_file)?;
    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<Result<Vec<_>, _>>()?;

    let key_bytes = std::fs::read(&context.certificate_key_file)?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", context.certificate_key_file))?;

    let mut ca_certs = Vec::new();
    if let Some(ca_file) = &context.ca_certificate_file {
        let bytes = std::fs::read(ca_file)?;
        for cert in rustls_pemfile::certs(&mut bytes.as_slice()) {
            ca_certs.push(cert?);
        }
    }
    if let Some(ca_path) = &context.ca_certificate_path {
        for entry in std::fs::read_dir(ca_path)? {
            let bytes = std::fs::read(entry?.path())?;
            for cert in rustls_pemfile::certs(&mut bytes.as_slice()) {
                ca_certs.push(cert?);
            }
        }
    }

    Ok(TlsMaterial { certs, key, ca_certs })
}

fn root_store(ca_certs: &[CertificateDer<'static>]) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert.clone())?;
    }
    Ok(roots)
}

/// One outbound connector per server peer: the CN check is bound to that
/// peer's configured hostname, so the verifier (and therefore the
/// `rustls::ClientConfig`) cannot be shared across peers with different
/// names even when they share a `TLS { }` context.
fn build_client_connector(material: &TlsMaterial, expected_hostname: &str) -> anyhow::Result<TlsConnector> {
    let roots = Arc::new(root_store(&material.ca_certs)?);
    let verifier = Arc::new(CommonNameVerifier::new(roots, expected_hostname.to_string())?);

    let config = RustlsClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(material.certs.clone(), material.key.clone_key())?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// One inbound acceptor for the whole proxy: its own identity is the first
/// referenced TLS context's certificate/key, and its trusted roots are the
/// union of every context a TLS client references (spec §9 Open Question:
/// multiple distinct server-side identities are not supported, matching the
/// common single-listener deployment).
fn build_server_acceptor(identity: &TlsMaterial, trusted_ca: &[CertificateDer<'static>]) -> anyhow::Result<TlsAcceptor> {
    let roots = Arc::new(root_store(trusted_ca)?);
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(roots).build()?;

    let config = RustlsServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn resolve_addresses(host: &str, port: u16) -> Result<Vec<SocketAddr>, ConfigError> {
    let target = if host.contains(':') { host.to_string() } else { format!("{host}:{port}") };

    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|_| ConfigError::UnresolvedHost(host.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(ConfigError::UnresolvedHost(host.to_string()));
    }

    Ok(addrs)
}

fn to_core_transport(kind: TransportKind, tls_name: Option<&str>) -> Transport {
    match kind {
        TransportKind::Udp => Transport::Udp,
        TransportKind::Tls => Transport::Tls { tls_config: tls_name.unwrap_or_default().to_string() },
    }
}

pub async fn startup(config: Config) -> anyhow::Result<()> {
    let mut tls_material = HashMap::new();
    for (name, context) in &config.tls {
        tls_material.insert(name.clone(), load_tls_material(context)?);
    }

    for section in &config.clients {
        if let Some(name) = &section.tls {
            if !tls_material.contains_key(name) {
                return Err(ConfigError::UnknownTlsContext(name.clone()).into());
            }
        }
    }
    for section in &config.servers {
        if let Some(name) = &section.tls {
            if !tls_material.contains_key(name) {
                return Err(ConfigError::UnknownTlsContext(name.clone()).into());
            }
        }
    }

    let stats = Statistics::new();

    let udp_client_count = config.clients.iter().filter(|s| s.transport == TransportKind::Udp).count();
    let (udp_reply_tx, udp_reply_rx) = if udp_client_count > 0 {
        let (tx, rx) = proxy_core::peer::udp_reply_channel(udp_client_count);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let mut clients = Vec::new();
    for section in &config.clients {
        let default_port = match section.transport { TransportKind::Udp => DEFAULT_RADIUS_PORT, TransportKind::Tls => DEFAULT_RADSEC_PORT };
        let addresses = resolve_addresses(&section.host, default_port)?;

        let peer_config = PeerClientConfig {
            name: section.host.clone(),
            transport: to_core_transport(section.transport, section.tls.as_deref()),
            addresses,
            secret: section.secret.clone().into_bytes(),
        };

        let peer = match section.transport {
            TransportKind::Udp => {
                ClientPeer::new_udp(peer_config, udp_reply_tx.clone().expect("sized by udp_client_count above"))
            }
            TransportKind::Tls => ClientPeer::new(peer_config),
        };

        clients.push(peer);
    }

    let needs_udp_listener =
        config.listen_udp.is_some() || clients.iter().any(|c| matches!(c.config.transport, Transport::Udp));

    let udp_listen_socket = if needs_udp_listener {
        let addr = config.listen_udp.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_RADIUS_PORT)));
        Some(Arc::new(UdpSocket::bind(addr).await?))
    } else {
        None
    };

    let mut servers = Vec::new();
    for section in &config.servers {
        let default_port = match section.transport { TransportKind::Udp => DEFAULT_RADIUS_PORT, TransportKind::Tls => DEFAULT_RADSEC_PORT };
        let addresses = resolve_addresses(&section.host, section.port.unwrap_or(default_port))?;

        let udp_socket = match section.transport {
            TransportKind::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addresses[0]).await?;
                Some(Arc::new(socket))
            }
            TransportKind::Tls => None,
        };

        servers.push(Arc::new(ServerPeer::new(
            PeerServerConfig {
                name: section.host.clone(),
                transport: to_core_transport(section.transport, section.tls.as_deref()),
                addresses,
                secret: section.secret.clone().into_bytes(),
                status_server: section.status_server,
            },
            udp_socket,
        )));
    }

    let mut realms = Vec::new();
    for section in &config.realms {
        let server = section
            .server
            .as_ref()
            .and_then(|name| servers.iter().find(|s| s.config.name.eq_ignore_ascii_case(name)).cloned());
        realms.push(Realm::compile(&section.pattern, server, section.reply_message.clone())?);
    }

    let registry = Registry::new(clients.clone(), servers.clone(), RealmRouter::new(realms));

    for server in &servers {
        tokio::spawn(client::run_sender(server.clone()));
        tokio::spawn(client::run_receiver(server.clone(), registry.clone(), stats.clone()));

        if let Transport::Tls { tls_config } = &server.config.transport {
            let material = tls_material.get(tls_config).expect("validated above");
            let connector = build_client_connector(material, &server.config.name)?;
            let server_name = ServerName::try_from(server.config.name.clone())
                .map_err(|_| anyhow::anyhow!("`{}` is not a usable TLS server name", server.config.name))?;
            tokio::spawn(client::run_tls_connector(server.clone(), connector, server_name));
        }
    }

    if let Some(socket) = &udp_listen_socket {
        tokio::spawn(server::run_udp_listener(socket.clone(), registry.clone(), stats.clone()));

        if let Some(rx) = udp_reply_rx {
            tokio::spawn(server::run_udp_replier(socket.clone(), rx));
        }
    }

    let tls_context_names: Vec<&str> = clients
        .iter()
        .filter_map(|c| match &c.config.transport {
            Transport::Tls { tls_config } => Some(tls_config.as_str()),
            Transport::Udp => None,
        })
        .collect();

    if let (Some(listen_tcp), false) = (config.listen_tcp, tls_context_names.is_empty()) {
        let identity_name = tls_context_names[0];
        let identity = tls_material.get(identity_name).expect("validated above");

        let mut trusted_ca = Vec::new();
        for name in &tls_context_names {
            trusted_ca.extend(tls_material.get(*name).expect("validated above").ca_certs.iter().cloned());
        }

        let acceptor = build_server_acceptor(identity, &trusted_ca)?;
        let listener = TcpListener::bind(listen_tcp).await?;
        tokio::spawn(server::run_tls_listener(listener, acceptor, registry.clone(), stats.clone()));
    }

    std::future::pending::<()>().await;
    Ok(())
}
