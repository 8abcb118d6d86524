//! Keychain error types.

use thiserror::Error;

/// Errors from the file store and keyring.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// The alias is already taken.
    #[error("alias already exists")]
    KeyExists,

    /// No key matches the requested identity.
    #[error("unknown key")]
    KeyNotFound,

    /// The key exists but its DEK is not in memory.
    #[error("key is locked")]
    KeyLocked,

    /// The requested (level, round) does not exceed the stored watermark.
    #[error("stale watermark")]
    StaleWatermark,

    /// The signing payload failed validation.
    #[error("malformed signing payload")]
    BadPayload,

    /// Wrong master password, or ciphertext no longer authenticates.
    /// Deliberately indistinguishable from a missing key at this layer.
    #[error("bad password or unknown key")]
    BadPassword,

    /// The persisted watermark state failed authentication.
    #[error("watermark state corrupted")]
    KeyStateCorrupted,

    /// The encrypted scalar failed authentication; the key is unusable.
    #[error("corrupted key secret")]
    SecretCorrupted,

    /// `init_master` was called on an initialized store.
    #[error("master store already initialized")]
    MasterAlreadyInitialized,

    /// An operation required master.json or seed.bin and it was absent.
    #[error("master store not initialized")]
    MasterMissing,

    /// Alias failed validation (`[a-z0-9_-]{1,64}` after normalization).
    #[error("invalid alias")]
    InvalidAlias,

    /// SetLevel target does not strictly exceed every per-kind level.
    #[error("level must exceed current {kind} level {current}")]
    LevelNotAbove {
        kind: &'static str,
        current: u64,
    },

    /// Persisting the watermark state failed; the signature was withheld.
    #[error("failed to persist watermark state: {0}")]
    PersistFailed(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// AEAD parameters were malformed (wrong key or nonce length).
    #[error("cipher failure")]
    Cipher,

    /// BLS operation failed.
    #[error(transparent)]
    Bls(#[from] vaultsign_crypto::BlsError),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON document (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key-state blob (de)serialization failed.
    #[error("state codec error: {0}")]
    Codec(#[from] bincode::Error),
}
