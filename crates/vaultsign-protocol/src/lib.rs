//! Signer protocol messages.
//!
//! The broker is payload-opaque; both sides interpret payloads as the
//! tagged messages defined here, serialized with bincode. Every response
//! either matches its request variant or is the shared [`Response::Error`]
//! with a stable numeric code, so the host sees consistent semantics
//! whether a failure happened in transport framing or in keychain logic.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// Stable wire error codes (values preserved for host compatibility).
pub mod codes {
    /// Catch-all for internal failures with no dedicated code.
    pub const INTERNAL: u32 = 0;
    /// Unlock attempts are temporarily throttled.
    pub const UNLOCK_THROTTLED: u32 = 12;
    /// No key matches the requested identity.
    pub const KEY_NOT_FOUND: u32 = 31;
    /// The key exists but is locked.
    pub const KEY_LOCKED: u32 = 32;
    /// The requested (level, round) does not exceed the stored watermark.
    pub const STALE_WATERMARK: u32 = 33;
    /// The signing payload failed validation.
    pub const BAD_PAYLOAD: u32 = 34;
    /// Delete attempts are temporarily throttled.
    pub const DELETE_THROTTLED: u32 = 92;
    /// Delete rejected: master password mismatch.
    pub const DELETE_BAD_PASSWORD: u32 = 93;
}

/// Requests accepted by the signer dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Report whether the master store exists and its mode.
    InitInfo,
    /// Create the master store and seed record. Fails if already present.
    InitMaster {
        /// Enable hierarchical-deterministic key derivation.
        deterministic: bool,
        /// Master passphrase (wiped by the receiver after use).
        passphrase: Vec<u8>,
    },
    /// List all keys with identity and watermark state.
    Status,
    /// Create one key per requested alias; empty alias means auto-assign.
    NewKeys {
        aliases: Vec<String>,
        passphrase: Vec<u8>,
    },
    /// Sign a payload with the key addressed by tz4.
    Sign { tz4: String, message: Vec<u8> },
    /// Unlock the listed keys.
    Unlock {
        aliases: Vec<String>,
        passphrase: Vec<u8>,
    },
    /// Lock the listed keys, wiping their in-memory material.
    Lock { aliases: Vec<String> },
    /// Delete the listed keys after verifying the master passphrase.
    DeleteKeys {
        aliases: Vec<String>,
        passphrase: Vec<u8>,
    },
    /// Administrative watermark override for provisioning or recovery.
    SetLevel { alias: String, level: u64 },
    /// Return up to `limit` recent device log lines.
    Logs { limit: u32 },
}

impl Request {
    /// Wipe any passphrase material carried by this request.
    pub fn wipe_secrets(&mut self) {
        match self {
            Request::InitMaster { passphrase, .. }
            | Request::NewKeys { passphrase, .. }
            | Request::Unlock { passphrase, .. }
            | Request::DeleteKeys { passphrase, .. } => passphrase.zeroize(),
            _ => {}
        }
    }
}

/// Responses produced by the signer dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to [`Request::InitInfo`].
    InitInfo {
        master_present: bool,
        deterministic: bool,
    },
    /// Generic success acknowledgement.
    Ok { ok: bool },
    /// Answer to [`Request::Status`].
    Status { keys: Vec<KeyStatus> },
    /// Answer to [`Request::NewKeys`].
    NewKeys { results: Vec<NewKeyResult> },
    /// Answer to [`Request::Sign`]: the compressed signature.
    Sign { signature: Vec<u8> },
    /// Answer to [`Request::Unlock`].
    Unlock { results: Vec<KeyResult> },
    /// Answer to [`Request::Lock`].
    Lock { results: Vec<KeyResult> },
    /// Answer to [`Request::DeleteKeys`].
    DeleteKeys { results: Vec<KeyResult> },
    /// Answer to [`Request::Logs`].
    Logs { lines: Vec<String> },
    /// Shared failure variant.
    Error { code: u32, message: String },
}

/// Per-key outcome for unlock/lock/delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResult {
    pub alias: String,
    pub ok: bool,
    /// Failure description when `ok` is false; never contains secrets.
    pub error: Option<String>,
}

/// Per-key outcome for key creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKeyResult {
    pub alias: String,
    pub tz4: String,
    pub bl_pubkey: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Watermark pair as reported in status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkStatus {
    pub level: u64,
    pub round: u32,
}

/// Per-key status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub alias: String,
    pub tz4: String,
    pub bl_pubkey: String,
    pub pop: String,
    pub locked: bool,
    /// The persisted watermark state failed authentication; signing is
    /// refused until an operator recovers via SetLevel.
    pub state_corrupted: bool,
    pub block: WatermarkStatus,
    pub preattestation: WatermarkStatus,
    pub attestation: WatermarkStatus,
}

/// Protocol codec error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message (de)serialization failed.
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Encode a request for the wire.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(request)?)
}

/// Decode a request from the wire.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Encode a response for the wire.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(response)?)
}

/// Decode a response from the wire.
pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}
