//! Keychain core: password-protected, two-tier encrypted key storage with
//! crash-safe high-watermark state.
//!
//! Layering:
//! - [`store`]: the on-disk layout (master params, seed record, per-key
//!   bundles and watermark state) with atomic writes and crash recovery;
//! - [`keyring`]: the in-memory registry enforcing the monotonic watermark
//!   rule under a per-key lock and persisting on every signature;
//! - [`payload`]: the pure validator extracting (kind, level, round) from
//!   a signing payload;
//! - [`watermark`]: the signing kinds and the lexicographic watermark rule.
//!
//! Key material is wrapped twice: a per-key DEK encrypts the BLS scalar,
//! and the DEK itself is wrapped by a KEK derived from the master password
//! with Argon2id. All AES-GCM ciphertexts are bound to the key identity via
//! associated data, so bundles cannot be swapped between key directories.

pub mod keyring;
pub mod payload;
pub mod store;
pub mod watermark;

mod error;

pub use error::KeychainError;
pub use keyring::{KeyRing, KeyStatusEntry, NewKey};
pub use payload::{validate_sign_payload, ValidatedPayload};
pub use store::{ArgonParams, FileStore};
pub use watermark::{KeyState, SignKind, Watermark};
