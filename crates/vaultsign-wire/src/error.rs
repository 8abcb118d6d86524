//! Codec error types.

use thiserror::Error;

/// Errors from frame encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload exceeds [`crate::MAX_PAYLOAD`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Fixed destination buffer cannot hold header + payload.
    #[error("destination too small: need {need} bytes, have {have}")]
    DstTooSmall { need: usize, have: usize },
}

/// Recoverable decode failures.
///
/// Each variant is reported with the read cursor already advanced past the
/// offending magic, so the caller can simply retry the decode to resync.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Header parity byte did not match.
    #[error("bad header parity")]
    BadParity,

    /// Header kind byte is not a known frame kind.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Declared payload length exceeds [`crate::MAX_PAYLOAD`].
    #[error("invalid payload size: {0} bytes")]
    InvalidPayloadSize(usize),
}
