//! Cryptographic primitives for VaultSign.
//!
//! This crate provides:
//! - BLS12-381 (min_pk) signing with domain separation and
//!   proofs-of-possession for consensus keys;
//! - tz4 / BLpk / BLsig base58check rendering;
//! - deterministic child-key derivation from a device seed;
//! - secret wrappers that wipe on drop.

pub mod address;
pub mod bls;
pub mod hd;
pub mod secure;

mod error;

pub use address::{blpk_from_pubkey_bytes, blsig_from_signature_bytes, tz4_from_pubkey_bytes};
pub use bls::{BlsPublicKey, BlsSecretKey, BlsSignature, DST_CONSENSUS, DST_POP};
pub use error::BlsError;
pub use hd::derive_child_key;
pub use secure::{clone_secret, secret_bytes, wipe, SecretBytes};
