//! The upstream side of the proxy: one sender task and one receiver task
//! per configured server peer (spec §4.3).
//!
//! Grounded on `turn-server/src/server.rs`'s task-per-transport loops and
//! `crates/service/src/forwarding.rs`'s decode-then-dispatch shape, adapted
//! from "one shared listener" to "one task pair per configured upstream
//! server".

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use codec::message::attr;
use codec::{Code, RadiusMessage};

use crate::peer::{QueuedReply, ServerPeer, Transport};
use crate::registry::Registry;
use crate::request_table::{PendingRequest, RequestKind};
use crate::statistics::{PeerId, Statistics};
use crate::tls::TlsSession;

/// Keepalive/liveness-probe period: spec §4.3 names "≈25 s + jitter 0..7 s".
pub const STATUS_SERVER_PERIOD: Duration = Duration::from_secs(25);
pub const STATUS_SERVER_JITTER_MAX: Duration = Duration::from_secs(7);

fn status_server_deadline(now: Instant) -> Instant {
    let jitter_ms = rand::thread_rng().next_u64() % STATUS_SERVER_JITTER_MAX.as_millis() as u64;
    now + STATUS_SERVER_PERIOD + Duration::from_millis(jitter_ms)
}

/// One task per configured upstream server: drains its request table,
/// retransmits, and emits periodic Status-Server probes.
pub async fn run_sender(server: Arc<ServerPeer>) {
    let mut next_status_server_deadline = status_server_deadline(Instant::now());

    loop {
        let now = Instant::now();
        let outcome = server.table.lock().await.sweep(now);

        for bytes in &outcome.retransmit {
            transmit(&server, bytes).await;
        }

        if server.config.status_server && now >= next_status_server_deadline {
            send_status_server_probe(&server).await;
            next_status_server_deadline = status_server_deadline(now);
        }

        let wakeup = [outcome.next_wakeup, Some(next_status_server_deadline)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + Duration::from_secs(1));

        let timeout = wakeup.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));

        tokio::select! {
            _ = server.newrq_signal.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }

        if outcome.status_server_suspect {
            log::warn!("server {}: Status-Server probe unanswered, marking suspect", server.config.name);
            server.set_connection_ok(false);
        }
    }
}

async fn send_status_server_probe(server: &Arc<ServerPeer>) {
    let mut table = server.table.lock().await;
    let id = match table.next_free_id() {
        Ok(id) => id,
        Err(err) => {
            log::warn!("server {}: could not queue Status-Server probe: {err}", server.config.name);
            return;
        }
    };

    let mut authenticator = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut authenticator);

    let message = RadiusMessage {
        code: Code::StatusServer,
        identifier: id,
        authenticator,
        attributes: vec![codec::Attribute::new(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16])],
    };

    let mut bytes = message.encode();
    let ma_offset = bytes.len() - 16;
    if codec::crypto::fill_message_authenticator(&mut bytes, ma_offset, &server.config.secret).is_err() {
        return;
    }

    let to_transmit = bytes.clone();
    table.insert_at(
        id,
        PendingRequest {
            buffer: bytes,
            origin_client: usize::MAX,
            origin_id: id,
            origin_authenticator: authenticator,
            origin_address: None,
            kind: RequestKind::StatusServer,
            tries: 0,
            expiry: Instant::now(),
            received: false,
        },
    );
    drop(table);

    transmit(server, &to_transmit).await;
}

/// Transmit contract (spec §4.3): UDP `send` is best-effort; TLS retries
/// through reconnect until a non-negative return.
async fn transmit(server: &Arc<ServerPeer>, bytes: &[u8]) {
    match &server.config.transport {
        Transport::Udp => {
            let Some(socket) = &server.udp_socket else { return };
            if let Err(err) = socket.send(bytes).await {
                log::warn!("server {}: UDP send failed: {err}", server.config.name);
            }
        }
        Transport::Tls { .. } => {
            if let Some(tls) = &server.tls {
                let mut session = tls.lock().await;
                loop {
                    match session.write_message(bytes).await {
                        Ok(()) => break,
                        Err(err) => {
                            log::warn!("server {}: TLS write failed, reconnecting: {err}", server.config.name);
                            server.set_connection_ok(false);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

/// One task per configured upstream server: reads responses, correlates to
/// the request table, re-encrypts attributes, and forwards the reply.
pub async fn run_receiver(server: Arc<ServerPeer>, registry: Arc<Registry>, stats: Statistics) {
    loop {
        let received = match &server.config.transport {
            Transport::Udp => receive_udp(&server).await,
            Transport::Tls { .. } => receive_tls(&server).await,
        };

        let Some(bytes) = received else { continue };

        stats.record_received(PeerId::Server(server.config.name.clone()), bytes.len());

        if let Err(err) = handle_response(&server, &registry, &stats, bytes).await {
            log::warn!("server {}: dropping malformed response: {err}", server.config.name);
            stats.record_error(PeerId::Server(server.config.name.clone()));
        }
    }
}

async fn receive_udp(server: &Arc<ServerPeer>) -> Option<Vec<u8>> {
    let socket = server.udp_socket.as_ref()?;
    let mut buf = vec![0u8; codec::message::MAX_PACKET_LEN];
    match socket.recv(&mut buf).await {
        Ok(n) => {
            buf.truncate(n);
            Some(buf)
        }
        Err(err) => {
            log::warn!("server {}: UDP recv failed: {err}", server.config.name);
            None
        }
    }
}

async fn receive_tls(server: &Arc<ServerPeer>) -> Option<Vec<u8>> {
    let tls = server.tls.as_ref()?;

    {
        let session = tls.lock().await;
        if !session.is_connected() {
            drop(session);
            // Nothing to read until `run_tls_connector` re-establishes the
            // session; avoid spinning the receiver loop hot while it waits.
            tokio::time::sleep(Duration::from_millis(200)).await;
            return None;
        }
    }

    let mut session = tls.lock().await;
    match session.read_message().await {
        Ok(message) => Some(message.encode()),
        Err(err) => {
            log::warn!("server {}: TLS read failed: {err}", server.config.name);
            server.set_connection_ok(false);
            None
        }
    }
}

/// Maintains the outbound TLS connection for a server peer: dials with
/// backoff whenever the session is disconnected (spec §4.5).
pub async fn run_tls_connector(server: Arc<ServerPeer>, connector: TlsConnector, server_name: ServerName<'static>) {
    let Some(tls) = server.tls.as_ref() else { return };
    let mut last_attempt = Instant::now() - Duration::from_secs(100_000);

    loop {
        if tls.lock().await.is_connected() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let wait = TlsSession::backoff(server.connection_ok(), last_attempt, Instant::now());
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }

        last_attempt = Instant::now();
        server.set_last_connect_attempt_unix_ms(unix_millis_now());

        let mut session = tls.lock().await;
        match session.connect(&server.config.addresses, &connector, server_name.clone()).await {
            Ok(()) => {
                log::info!("server {}: TLS connected", server.config.name);
                server.set_connection_ok(true);
            }
            Err(err) => {
                log::warn!("server {}: TLS connect failed: {err}", server.config.name);
                server.set_connection_ok(false);
            }
        }
    }
}

fn unix_millis_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Spec §4.3 steps 2-10: validate, correlate, re-encrypt, forward.
async fn handle_response(
    server: &Arc<ServerPeer>,
    registry: &Arc<Registry>,
    stats: &Statistics,
    bytes: Vec<u8>,
) -> crate::error::Result<()> {
    let reply = RadiusMessage::decode(&bytes)?;

    if !matches!(reply.code, Code::AccessAccept | Code::AccessReject | Code::AccessChallenge) {
        log::warn!("server {}: unexpected reply code, discarding", server.config.name);
        return Ok(());
    }

    let id = reply.identifier;

    let mut table = server.table.lock().await;
    let (kind, origin_client, origin_id, origin_authenticator, origin_address) = {
        let Some(request) = table.lookup(id) else {
            log::warn!("server {}: reply for unknown id {id}, discarding", server.config.name);
            return Ok(());
        };

        if request.received || request.tries == 0 {
            return Ok(());
        }

        (request.kind, request.origin_client, request.origin_id, request.origin_authenticator, request.origin_address)
    };

    if !codec::crypto::verify_response_authenticator(&bytes, &origin_authenticator, &server.config.secret) {
        log::warn!("server {}: Response Authenticator mismatch for id {id}", server.config.name);
        return Err(crate::error::Error::AuthMismatch);
    }

    if let Some(ma) = reply.get(attr::MESSAGE_AUTHENTICATOR) {
        if ma.len() == 16 {
            let ma_offset = bytes.len() - 16;
            let mut scratch = bytes.clone();
            scratch[4..20].copy_from_slice(&origin_authenticator);
            if !codec::crypto::verify_message_authenticator(&scratch, ma_offset, &server.config.secret)? {
                return Err(crate::error::Error::AuthMismatch);
            }
        }
    }

    if kind == RequestKind::StatusServer {
        table.mark_received(id);
        server.set_connection_ok(true);
        return Ok(());
    }

    drop(table);

    let Some(client) = registry.client_by_id(origin_client) else {
        return Ok(());
    };

    let mut rewritten = bytes;
    let mut message = RadiusMessage::decode(&rewritten)?;

    for vendor_attr in message.vendor_attributes(attr::VENDOR_MICROSOFT) {
        if vendor_attr.kind != attr::MS_MPPE_SEND_KEY && vendor_attr.kind != attr::MS_MPPE_RECV_KEY {
            continue;
        }
        if vendor_attr.value.len() < 2 {
            continue;
        }

        let salt = [vendor_attr.value[0], vendor_attr.value[1]];
        let mut key = vendor_attr.value[2..].to_vec();

        codec::crypto::decrypt_mppe_key(&mut key, &server.config.secret, &origin_authenticator, salt)?;
        codec::crypto::encrypt_mppe_key(&mut key, &client.config.secret, &origin_authenticator, salt)?;

        let mut new_value = salt.to_vec();
        new_value.extend_from_slice(&key);
        message.set_vendor_attribute(attr::VENDOR_MICROSOFT, vendor_attr.kind, &new_value);
    }

    message.identifier = origin_id;
    message.authenticator = origin_authenticator;
    rewritten = message.encode();

    if let Some(ma_value) = message.get(attr::MESSAGE_AUTHENTICATOR) {
        if ma_value.len() == 16 {
            let ma_offset = rewritten.len() - 16;
            codec::crypto::fill_message_authenticator(&mut rewritten, ma_offset, &client.config.secret)?;
        }
    }

    let mut table = server.table.lock().await;
    table.mark_received(id);
    drop(table);

    stats.record_sent(PeerId::Client(client.config.name.clone()), rewritten.len());

    let queued = QueuedReply { buffer: rewritten, dest_addr: origin_address };
    if client.reply_tx.try_send(queued).is_err() {
        log::warn!("client {}: reply queue full, dropping reply", client.config.name);
        stats.record_error(PeerId::Client(client.config.name.clone()));
    }

    Ok(())
}

pub fn resolve_first(addresses: &[SocketAddr]) -> Option<SocketAddr> {
    addresses.first().copied()
}
