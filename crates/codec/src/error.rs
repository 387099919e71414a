#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("declared length {declared} does not match received length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("attribute at offset {0} has an invalid length")]
    BadAttribute(usize),
    #[error("{0} trailing byte(s) after the last attribute")]
    TrailingGarbage(usize),
    #[error("unknown RADIUS code {0}")]
    UnknownCode(u8),
    #[error("buffer too small to encode packet")]
    BufferTooSmall,
    #[error("crypto input has an invalid length: {0}")]
    InvalidLength(usize),
}

/// RADIUS packet codes this proxy understands (RFC 2865 §3, RFC 5997).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccessChallenge = 11,
    StatusServer = 12,
}

impl TryFrom<u8> for Code {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::AccessRequest,
            2 => Self::AccessAccept,
            3 => Self::AccessReject,
            11 => Self::AccessChallenge,
            12 => Self::StatusServer,
            other => return Err(Error::UnknownCode(other)),
        })
    }
}

impl From<Code> for u8 {
    fn from(value: Code) -> Self {
        value as u8
    }
}
