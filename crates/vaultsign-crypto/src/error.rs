//! Crypto error types.

use thiserror::Error;

/// Errors from BLS key and signature handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlsError {
    /// Scalar bytes are not a valid secret key.
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// Bytes are not a valid compressed G1 point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Bytes are not a valid compressed G2 point.
    #[error("invalid signature")]
    InvalidSignature,

    /// Key derivation material was rejected.
    #[error("key derivation failed")]
    DerivationFailed,
}
