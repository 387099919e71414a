//! The downstream side of the proxy: accepts inbound UDP datagrams and TLS
//! connections from configured clients, routes by realm, and replies
//! (spec §4.4, §4.6).
//!
//! Grounded on `turn-server/src/server.rs`'s dual-transport accept loops and
//! `crates/service/src/routing/mod.rs`'s decode-dispatch pattern.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use codec::message::attr;
use codec::{Code, RadiusMessage};

use crate::peer::{ClientPeer, QueuedReply, ServerPeer};
use crate::registry::Registry;
use crate::request_table::{PendingRequest, RequestKind};
use crate::statistics::{PeerId, Statistics};
use crate::tls;

/// Accepts inbound UDP datagrams on the configured listen address, matches
/// the source to a configured client, and dispatches each request.
pub async fn run_udp_listener(socket: Arc<UdpSocket>, registry: Arc<Registry>, stats: Statistics) {
    let mut buf = vec![0u8; codec::message::MAX_PACKET_LEN];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("UDP listener: recv failed: {err}");
                continue;
            }
        };

        let Some((client_id, client)) = registry.client_by_udp_source(src) else {
            log::warn!("UDP listener: datagram from unrecognized source {src}, dropping");
            continue;
        };

        stats.record_received(PeerId::Client(client.config.name.clone()), n);

        let bytes = buf[..n].to_vec();
        let registry = registry.clone();
        let stats = stats.clone();
        let client = client.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_request(bytes, client_id, &client, Some(src), &registry, &stats).await {
                log::warn!("dropping request from client {}: {err}", client.config.name);
                stats.record_error(PeerId::Client(client.config.name.clone()));
            }
        });
    }
}

/// Spec §4.4 steps 1-12: validate, route by realm, re-encrypt, forward to
/// the matched server peer's request table.
async fn handle_request(
    bytes: Vec<u8>,
    client_id: usize,
    client: &Arc<ClientPeer>,
    source_addr: Option<SocketAddr>,
    registry: &Arc<Registry>,
    stats: &Statistics,
) -> crate::error::Result<()> {
    let message = RadiusMessage::decode(&bytes)?;

    if message.code == Code::StatusServer {
        reply_status_server_ok(client, &message, source_addr).await;
        return Ok(());
    }

    if message.code != Code::AccessRequest {
        log::warn!("client {}: unexpected request code, dropping", client.config.name);
        return Ok(());
    }

    let Some(username) = message.user_name() else {
        log::warn!("client {}: Access-Request missing User-Name, dropping", client.config.name);
        return Ok(());
    };

    let Some(realm) = registry.realms.match_username(username) else {
        log::warn!("client {}: no realm matched {username}, dropping", client.config.name);
        return Ok(());
    };

    let Some(server) = &realm.server else {
        send_access_reject(client, &message, realm.reject_message.as_deref(), source_addr).await;
        return Ok(());
    };

    {
        let table = server.table.lock().await;
        if table.lookup_by_origin(client_id, message.identifier).is_some() {
            log::debug!("client {}: duplicate id {}, in-flight request will answer", client.config.name, message.identifier);
            return Ok(());
        }
    }

    if let Some(ma) = message.get(attr::MESSAGE_AUTHENTICATOR) {
        if ma.len() == 16 {
            let ma_offset = bytes.len() - 16;
            if !codec::crypto::verify_message_authenticator(&bytes, ma_offset, &client.config.secret)? {
                return Err(crate::error::Error::AuthMismatch);
            }
        }
    }

    let mut new_authenticator = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut new_authenticator);

    let mut rewritten = message;
    let origin_authenticator = rewritten.authenticator;

    reencrypt_attribute(&mut rewritten, attr::USER_PASSWORD, &client.config.secret, &origin_authenticator, &server.config.secret, &new_authenticator)?;
    reencrypt_attribute(&mut rewritten, attr::TUNNEL_PASSWORD, &client.config.secret, &origin_authenticator, &server.config.secret, &new_authenticator)?;

    let origin_id = rewritten.identifier;
    rewritten.authenticator = new_authenticator;

    let out_len;
    {
        let mut table = server.table.lock().await;
        let id = table.next_free_id()?;
        rewritten.identifier = id;

        let mut out_bytes = rewritten.encode();
        if rewritten.get(attr::MESSAGE_AUTHENTICATOR).is_some() {
            let ma_offset = out_bytes.len() - 16;
            codec::crypto::fill_message_authenticator(&mut out_bytes, ma_offset, &server.config.secret)?;
        }

        out_len = out_bytes.len();
        table.insert_at(
            id,
            PendingRequest {
                buffer: out_bytes,
                origin_client: client_id,
                origin_id,
                origin_authenticator,
                origin_address: source_addr,
                kind: RequestKind::Normal,
                tries: 0,
                expiry: Instant::now(),
                received: false,
            },
        );
    }

    server.newrq_signal.notify_one();
    stats.record_sent(PeerId::Server(server.config.name.clone()), out_len);

    Ok(())
}

/// Re-encrypt a password-style attribute in place: decrypt under the
/// client's secret/original authenticator, re-encrypt under the server's
/// secret/new authenticator (spec §4.4 steps 8-9).
fn reencrypt_attribute(
    message: &mut RadiusMessage,
    kind: u8,
    client_secret: &[u8],
    origin_authenticator: &[u8; 16],
    server_secret: &[u8],
    new_authenticator: &[u8; 16],
) -> crate::error::Result<()> {
    for attribute in message.attributes.iter_mut().filter(|a| a.kind == kind) {
        let mut value = attribute.value.clone();
        codec::crypto::decrypt_password(&mut value, client_secret, origin_authenticator)?;
        codec::crypto::encrypt_password(&mut value, server_secret, new_authenticator)?;
        attribute.value = value;
    }

    Ok(())
}

/// Status-Server received directly from a client: answer immediately with
/// an empty Access-Accept echoing id, signed with the client's secret
/// (spec §4.4).
async fn reply_status_server_ok(client: &Arc<ClientPeer>, request: &RadiusMessage, dest_addr: Option<SocketAddr>) {
    let reply = RadiusMessage { code: Code::AccessAccept, identifier: request.identifier, authenticator: [0u8; 16], attributes: vec![] };

    let mut bytes = reply.encode();
    codec::crypto::sign_response(&mut bytes, &request.authenticator, &client.config.secret);

    enqueue_reply(client, bytes, dest_addr).await;
}

async fn send_access_reject(client: &Arc<ClientPeer>, request: &RadiusMessage, reject_message: Option<&str>, dest_addr: Option<SocketAddr>) {
    let mut attributes = Vec::new();
    if let Some(text) = reject_message {
        attributes.push(codec::Attribute::new(attr::REPLY_MESSAGE, text.as_bytes().to_vec()));
    }

    let reply = RadiusMessage { code: Code::AccessReject, identifier: request.identifier, authenticator: [0u8; 16], attributes };

    let mut bytes = reply.encode();
    codec::crypto::sign_response(&mut bytes, &request.authenticator, &client.config.secret);

    enqueue_reply(client, bytes, dest_addr).await;
}

async fn enqueue_reply(client: &Arc<ClientPeer>, buffer: Vec<u8>, dest_addr: Option<SocketAddr>) {
    if client.reply_tx.try_send(QueuedReply { buffer, dest_addr }).is_err() {
        log::warn!("client {}: reply queue full, dropping reply", client.config.name);
    }
}

/// The shared UDP writer (spec §5: "one shared UDP writer for all UDP
/// clients"): a single task drains the one channel every UDP `ClientPeer`'s
/// `reply_tx` feeds, and writes to the one listening socket. Sign was
/// already done by the caller that enqueued each reply.
pub async fn run_udp_replier(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<QueuedReply>) {
    while let Some(reply) = rx.recv().await {
        let Some(dest) = reply.dest_addr else {
            log::warn!("UDP replier: reply missing destination address, dropping");
            continue;
        };

        if let Err(err) = socket.send_to(&reply.buffer, dest).await {
            log::warn!("UDP replier: send failed: {err}");
        }
    }
}

pub async fn run_tls_replier(session: Arc<tokio::sync::Mutex<crate::tls::TlsSession>>, client: Arc<ClientPeer>) {
    let mut rx = client.reply_rx.as_ref().expect("TLS client has a private reply queue").lock().await;

    while let Some(reply) = rx.recv().await {
        let mut session = session.lock().await;
        if !session.is_connected() {
            log::warn!("client {}: TLS session torn down, dropping queued reply", client.config.name);
            continue;
        }

        if let Err(err) = session.write_message(&reply.buffer).await {
            log::warn!("client {}: TLS write failed: {err}", client.config.name);
        }
    }
}

/// Inbound RadSec: accept mutually-authenticated TLS connections, match the
/// peer certificate's Common Name to a configured TLS client, and run a
/// reader/writer pair for the life of the connection (spec §4.4, §4.6 for
/// the TLS transport; spec §4.5 "only one TLS connection per peer").
pub async fn run_tls_listener(listener: TcpListener, acceptor: TlsAcceptor, registry: Arc<Registry>, stats: Statistics) {
    loop {
        let (tcp, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("TLS listener: accept failed: {err}");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let stats = stats.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("TLS handshake with {peer_addr} failed: {err}");
                    return;
                }
            };

            let chain = stream.get_ref().1.peer_certificates().unwrap_or_default();
            let Some(common_name) = tls::peer_common_name(chain) else {
                log::warn!("TLS peer {peer_addr} presented no usable certificate, dropping");
                return;
            };

            let Some((client_id, client)) = registry
                .clients
                .iter()
                .enumerate()
                .find(|(_, client)| client.config.name.eq_ignore_ascii_case(&common_name))
            else {
                log::warn!("TLS peer {peer_addr} (CN {common_name}) matches no configured client, dropping");
                return;
            };

            if client.tls_connected.swap(true, std::sync::atomic::Ordering::AcqRel) {
                log::warn!("client {}: rejecting second simultaneous TLS connection", client.config.name);
                return;
            }

            run_tls_client_session(stream, client_id, client.clone(), registry, stats).await;
            client.tls_connected.store(false, std::sync::atomic::Ordering::Release);
        });
    }
}

async fn run_tls_client_session(
    stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    client_id: usize,
    client: Arc<ClientPeer>,
    registry: Arc<Registry>,
    stats: Statistics,
) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer_client = client.clone();
    let writer = tokio::spawn(async move {
        let mut rx = writer_client.reply_rx.as_ref().expect("TLS client has a private reply queue").lock().await;
        while let Some(reply) = rx.recv().await {
            if let Err(err) = tls::write_framed_message(&mut write_half, &reply.buffer).await {
                log::warn!("client {}: TLS write failed: {err}", writer_client.config.name);
                break;
            }
        }
    });

    loop {
        let bytes = match tls::read_framed_message(&mut read_half).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("client {}: TLS read failed, closing: {err}", client.config.name);
                break;
            }
        };

        stats.record_received(PeerId::Client(client.config.name.clone()), bytes.len());

        if let Err(err) = handle_request(bytes, client_id, &client, None, &registry, &stats).await {
            log::warn!("dropping request from client {}: {err}", client.config.name);
            stats.record_error(PeerId::Client(client.config.name.clone()));
        }
    }

    writer.abort();
}
