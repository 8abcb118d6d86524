//! Deterministic child-key derivation.
//!
//! Child keys are derived from the device seed, the store salt, and a
//! monotonically reserved index. The salt domain-separates devices sharing
//! a seed; the index makes every reservation yield a distinct key. The
//! chain is SHA-256 based and feeds blst's `key_gen`, so the resulting
//! scalar is always valid.

use crate::bls::BlsSecretKey;
use crate::error::BlsError;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const DERIVE_DOMAIN: &[u8] = b"vaultsign/hd/v1";

/// Derive the child secret key for `(seed, salt, index)`.
pub fn derive_child_key(
    seed: &[u8; 32],
    salt: &[u8],
    index: u32,
) -> Result<BlsSecretKey, BlsError> {
    let mut hasher = Sha256::new();
    hasher.update(DERIVE_DOMAIN);
    hasher.update(salt);
    hasher.update(seed);
    hasher.update(index.to_be_bytes());
    let first: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

    // Second pass mixes the seed back in so a leaked intermediate does not
    // expose the chain.
    let mut hasher = Sha256::new();
    hasher.update(first.as_ref());
    hasher.update(seed);
    let ikm: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

    BlsSecretKey::from_ikm(&ikm, DERIVE_DOMAIN)
}
