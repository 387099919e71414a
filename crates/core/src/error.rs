use std::io;

/// Errors surfaced by the peer/routing/transport layer (spec §7).
///
/// Non-fatal variants are caught at the task boundary, logged with
/// `log::warn!`, and the task keeps running; there is no proxy-level error
/// reply to the originator for any of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] codec::Error),

    #[error("authenticator or Message-Authenticator mismatch")]
    AuthMismatch,

    #[error("request table is full")]
    TableFull,

    #[error("reply queue is full")]
    QueueFull,

    #[error("no realm matched username")]
    NoMatchingRealm,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("peer certificate verification failed: {0}")]
    CertVerification(String),
}

pub type Result<T> = std::result::Result<T, Error>;
