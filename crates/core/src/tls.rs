//! TLS transport state: connection establishment with backoff, peer
//! certificate CN verification, length-framed RADIUS-over-TLS read/write
//! (spec §4.5).
//!
//! Grounded in shape on the teacher's `ssl` feature (`tokio-rustls`, mutual
//! TLS), generalized from "listener only" to "client-mode reconnect with
//! backoff" since the teacher never dials out over TLS itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;

use codec::message::{MAX_PACKET_LEN, MIN_PACKET_LEN};
use codec::RadiusMessage;

use crate::error::{Error, Result};

/// Matches `original_source/radsecproxy.c`'s `SSL_CTX_set_verify_depth(ctx,
/// MAX_CERT_DEPTH + 1)`: nine intermediate CAs permitted plus the leaf.
pub const MAX_CERT_DEPTH: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Disconnected,
    Connecting,
    Connected,
}

/// Verifies the peer's chain with the platform default algorithm set, then
/// requires one of the leaf certificate's Subject Common Name entries to
/// case-insensitively equal `expected_hostname`. No SAN matching — this
/// matches the source's actual (not modernized) behavior; see DESIGN.md
/// Open Question decision 1.
#[derive(Debug)]
pub struct CommonNameVerifier {
    roots: Arc<rustls::RootCertStore>,
    expected_hostname: String,
    inner: Arc<dyn ServerCertVerifier>,
}

impl CommonNameVerifier {
    pub fn new(roots: Arc<rustls::RootCertStore>, expected_hostname: String) -> Result<Self> {
        let inner = rustls::client::WebPkiServerVerifier::builder(roots.clone())
            .build()
            .map_err(|err| Error::Tls(err.to_string()))?;

        Ok(Self { roots, expected_hostname, inner })
    }

    fn leaf_common_name_matches(&self, leaf: &CertificateDer<'_>) -> bool {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf.as_ref()) else {
            return false;
        };

        cert.subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .any(|cn| cn.eq_ignore_ascii_case(&self.expected_hostname))
    }
}

impl ServerCertVerifier for CommonNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        if self.leaf_common_name_matches(end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "peer certificate CN does not match configured hostname {}",
                self.expected_hostname
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A client-mode TLS connection to one upstream RadSec server.
pub struct TlsSession {
    state: TlsState,
    stream: Option<ClientTlsStream<TcpStream>>,
}

impl TlsSession {
    pub fn new() -> Self {
        Self { state: TlsState::Disconnected, stream: None }
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TlsState::Connected
    }

    /// Backoff policy from spec §4.5, evaluated under the peer's mutex.
    /// Returns the duration to sleep before attempting to connect.
    pub fn backoff(connection_ok: bool, last_connect_attempt: Instant, now: Instant) -> Duration {
        if connection_ok {
            return Duration::from_secs(10);
        }

        let elapsed = now.saturating_duration_since(last_connect_attempt);
        match elapsed {
            e if e < Duration::from_secs(5) => Duration::from_secs(10),
            e if e < Duration::from_secs(300) => e,
            e if e < Duration::from_secs(100_000) => Duration::from_secs(600),
            _ => Duration::ZERO,
        }
    }

    /// Dial each address in order; on the first successful TCP connect, run
    /// the TLS handshake and verify the peer certificate. Marks state
    /// `Connecting` for the duration of the call so a concurrent caller does
    /// not re-enter (spec §9 Open Question decision 2).
    pub async fn connect(
        &mut self,
        addresses: &[SocketAddr],
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        if self.state == TlsState::Connecting {
            return Err(Error::Tls("connect already in progress".into()));
        }

        self.state = TlsState::Connecting;

        let mut last_err = None;
        for addr in addresses {
            match TcpStream::connect(addr).await {
                Ok(tcp) => match connector.connect(server_name.clone(), tcp).await {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        self.state = TlsState::Connected;
                        return Ok(());
                    }
                    Err(err) => last_err = Some(Error::Tls(err.to_string())),
                },
                Err(err) => last_err = Some(Error::Transport(err)),
            }
        }

        self.state = TlsState::Disconnected;
        Err(last_err.unwrap_or_else(|| Error::Tls("no addresses configured".into())))
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.state = TlsState::Disconnected;
    }

    /// Read one length-framed RADIUS message: the header's declared length
    /// IS the frame length (spec §4.5). A zero-length read or I/O error
    /// tears the session down.
    pub async fn read_message(&mut self) -> Result<RadiusMessage> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Tls("not connected".into()))?;

        let mut header = [0u8; 4];
        if let Err(err) = stream.read_exact(&mut header).await {
            self.disconnect();
            return Err(Error::Transport(err));
        }

        let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
        if declared < MIN_PACKET_LEN || declared > MAX_PACKET_LEN {
            self.disconnect();
            return Err(Error::Codec(codec::Error::LengthMismatch { declared, actual: declared }));
        }

        let mut buf = vec![0u8; declared];
        buf[0..4].copy_from_slice(&header);
        if let Err(err) = stream.read_exact(&mut buf[4..]).await {
            self.disconnect();
            return Err(Error::Transport(err));
        }

        RadiusMessage::decode(&buf).map_err(Error::from)
    }

    pub async fn write_message(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Tls("not connected".into()))?;

        if let Err(err) = stream.write_all(bytes).await {
            self.disconnect();
            return Err(Error::Transport(err));
        }

        Ok(())
    }
}

impl Default for TlsSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Length-framed read, generic over any async stream: shared by
/// [`TlsSession::read_message`]'s client-mode dialing and the inbound
/// RadSec accept loop, which terminates a `tokio_rustls::server::TlsStream`
/// rather than a client one.
pub async fn read_framed_message<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(Error::Transport)?;

    let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
    if declared < MIN_PACKET_LEN || declared > MAX_PACKET_LEN {
        return Err(Error::Codec(codec::Error::LengthMismatch { declared, actual: declared }));
    }

    let mut buf = vec![0u8; declared];
    buf[0..4].copy_from_slice(&header);
    stream.read_exact(&mut buf[4..]).await.map_err(Error::Transport)?;

    Ok(buf)
}

pub async fn write_framed_message<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(bytes).await.map_err(Error::Transport)
}

/// Extract the leaf certificate's Subject Common Name from a completed
/// handshake's peer certificate chain, matching
/// [`CommonNameVerifier::leaf_common_name_matches`]'s extraction but usable
/// standalone (the inbound accept path has no `CommonNameVerifier` instance,
/// only the raw chain).
pub fn peer_common_name(chain: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = chain.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    cert.subject().iter_common_name().find_map(|cn| cn.as_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_ten_seconds_right_after_a_good_connection_drops() {
        let now = Instant::now();
        assert_eq!(TlsSession::backoff(true, now, now), Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_with_elapsed_time_in_the_middle_band() {
        let last = Instant::now();
        let now = last + Duration::from_secs(120);
        assert_eq!(TlsSession::backoff(false, last, now), Duration::from_secs(120));
    }

    #[test]
    fn backoff_caps_at_ten_minutes_past_five_minutes_elapsed() {
        let last = Instant::now();
        let now = last + Duration::from_secs(301);
        assert_eq!(TlsSession::backoff(false, last, now), Duration::from_secs(600));
    }

    #[test]
    fn cold_start_has_no_backoff() {
        let last = Instant::now();
        let now = last + Duration::from_secs(100_001);
        assert_eq!(TlsSession::backoff(false, last, now), Duration::ZERO);
    }
}
