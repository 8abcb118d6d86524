//! Broker error types.

use thiserror::Error;
use vaultsign_wire::EncodeError;

/// Errors surfaced to `Broker::request` callers.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Payload exceeds the maximum frame payload.
    #[error("payload exceeds maximum frame payload")]
    PayloadTooLarge(usize),

    /// The caller's own deadline or cancellation fired.
    #[error("request cancelled")]
    Cancelled,

    /// The broker shut down or the transport failed fatally.
    #[error("broker disconnected")]
    Disconnected,

    /// Frame encoding failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
