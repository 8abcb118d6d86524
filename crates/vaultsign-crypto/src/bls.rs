//! BLS12-381 operations for consensus signing.
//!
//! Uses the min_pk variant (48-byte public keys, 96-byte signatures) with
//! the standard hash-to-curve ciphersuites: one domain tag for protocol
//! messages, a distinct one for proofs-of-possession so a PoP can never be
//! confused with a message signature.

use crate::error::BlsError;
use blst::min_pk::{PublicKey as BlstPubKey, SecretKey as BlstSecKey, Signature as BlstSig};
use blst::BLST_ERROR;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Domain separation tag for protocol message signing.
pub const DST_CONSENSUS: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Domain separation tag for proofs-of-possession.
pub const DST_POP: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// BLS12-381 secret key (32-byte scalar).
#[derive(Clone)]
pub struct BlsSecretKey(BlstSecKey);

impl BlsSecretKey {
    /// Generate a fresh random secret key.
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut ikm = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(ikm.as_mut());
        let sk = BlstSecKey::key_gen(ikm.as_ref(), &[]).expect("ikm is 32 bytes");
        Self(sk)
    }

    /// Derive from input key material (at least 32 bytes).
    pub fn from_ikm(ikm: &[u8; 32], info: &[u8]) -> Result<Self, BlsError> {
        BlstSecKey::key_gen(ikm, info)
            .map(Self)
            .map_err(|_| BlsError::DerivationFailed)
    }

    /// Load from a 32-byte little-endian scalar (the at-rest encoding).
    pub fn from_le_bytes(le: &[u8; 32]) -> Result<Self, BlsError> {
        let mut be = Zeroizing::new(*le);
        be.reverse();
        BlstSecKey::from_bytes(be.as_ref())
            .map(Self)
            .map_err(|_| BlsError::InvalidSecretKey)
    }

    /// Serialize to the 32-byte little-endian at-rest encoding.
    pub fn to_le_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new(self.0.to_bytes());
        out.reverse();
        out
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk())
    }

    /// Sign a protocol message.
    pub fn sign(&self, msg: &[u8]) -> BlsSignature {
        BlsSignature(self.0.sign(msg, DST_CONSENSUS, &[]))
    }

    /// Produce a proof-of-possession: a self-signature over the compressed
    /// public key under the PoP domain.
    pub fn sign_pop(&self) -> BlsSignature {
        let pk = self.public_key().to_bytes();
        BlsSignature(self.0.sign(&pk, DST_POP, &[]))
    }
}

impl std::fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsSecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// BLS12-381 public key (48 bytes compressed).
#[derive(Clone, PartialEq, Eq)]
pub struct BlsPublicKey(BlstPubKey);

impl BlsPublicKey {
    /// Load from 48 compressed bytes.
    pub fn from_bytes(bytes: &[u8; 48]) -> Result<Self, BlsError> {
        BlstPubKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| BlsError::InvalidPublicKey)
    }

    /// Serialize to 48 compressed bytes.
    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_bytes()
    }

    /// Verify a protocol message signature.
    pub fn verify(&self, msg: &[u8], sig: &BlsSignature) -> bool {
        sig.0.verify(true, msg, DST_CONSENSUS, &[], &self.0, true) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify a proof-of-possession produced by [`BlsSecretKey::sign_pop`].
    pub fn verify_pop(&self, pop: &BlsSignature) -> bool {
        let pk = self.to_bytes();
        pop.0.verify(true, &pk, DST_POP, &[], &self.0, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlsPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// BLS12-381 signature (96 bytes compressed).
#[derive(Clone)]
pub struct BlsSignature(BlstSig);

impl BlsSignature {
    /// Load from 96 compressed bytes.
    pub fn from_bytes(bytes: &[u8; 96]) -> Result<Self, BlsError> {
        BlstSig::from_bytes(bytes)
            .map(Self)
            .map_err(|_| BlsError::InvalidSignature)
    }

    /// Serialize to 96 compressed bytes.
    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_bytes()
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlsSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let pk = sk.public_key();
        let sig = sk.sign(b"protocol message");
        assert!(pk.verify(b"protocol message", &sig));
        assert!(!pk.verify(b"different message", &sig));
    }

    #[test]
    fn test_pop_domain_separation() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let pk = sk.public_key();

        let pop = sk.sign_pop();
        assert!(pk.verify_pop(&pop));

        // A message signature over the pubkey bytes is not a valid PoP.
        let fake = sk.sign(&pk.to_bytes());
        assert!(!pk.verify_pop(&fake));
    }

    #[test]
    fn test_le_scalar_roundtrip() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let le = sk.to_le_bytes();
        let restored = BlsSecretKey::from_le_bytes(&le).unwrap();
        assert_eq!(
            sk.public_key().to_bytes(),
            restored.public_key().to_bytes()
        );
    }

    #[test]
    fn test_invalid_scalar_rejected() {
        // The field modulus is < 2^255, so an all-0xFF scalar is invalid.
        let result = BlsSecretKey::from_le_bytes(&[0xFF; 32]);
        assert_eq!(result.unwrap_err(), BlsError::InvalidSecretKey);
    }

    #[test]
    fn test_pubkey_roundtrip() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let pk = sk.public_key();
        let restored = BlsPublicKey::from_bytes(&pk.to_bytes()).unwrap();
        assert_eq!(pk, restored);
    }

    #[test]
    fn test_signature_roundtrip() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let sig = sk.sign(b"roundtrip");
        let restored = BlsSignature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, restored);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let sk = BlsSecretKey::generate(&mut rand::thread_rng());
        let debug = format!("{:?}", sk);
        assert!(debug.contains("[REDACTED]"));
    }
}
