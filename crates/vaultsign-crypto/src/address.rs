//! Base58check rendering of BLS identities.
//!
//! A tz4 address is the base58check encoding of a 3-byte prefix followed by
//! the 20-byte blake2b digest of the compressed public key. Public keys and
//! signatures are rendered with their own prefixes (BLpk / BLsig).

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

const TZ4_PREFIX: [u8; 3] = [6, 161, 166];
const BLPK_PREFIX: [u8; 4] = [6, 149, 135, 204];
const BLSIG_PREFIX: [u8; 4] = [40, 171, 64, 207];

/// Address digest length (blake2b-160).
const ADDRESS_DIGEST_LEN: usize = 20;

/// Render the tz4 address of a compressed public key.
pub fn tz4_from_pubkey_bytes(pubkey: &[u8; 48]) -> String {
    let mut hasher = Blake2bVar::new(ADDRESS_DIGEST_LEN).expect("20 is a valid blake2b size");
    hasher.update(pubkey);
    let mut digest = [0u8; ADDRESS_DIGEST_LEN];
    hasher
        .finalize_variable(&mut digest)
        .expect("output length matches");
    b58check(&TZ4_PREFIX, &digest)
}

/// Render a compressed public key as a BLpk string.
pub fn blpk_from_pubkey_bytes(pubkey: &[u8; 48]) -> String {
    b58check(&BLPK_PREFIX, pubkey)
}

/// Render a compressed signature as a BLsig string.
pub fn blsig_from_signature_bytes(sig: &[u8; 96]) -> String {
    b58check(&BLSIG_PREFIX, sig)
}

fn b58check(prefix: &[u8], payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(prefix.len() + payload.len());
    data.extend_from_slice(prefix);
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}
