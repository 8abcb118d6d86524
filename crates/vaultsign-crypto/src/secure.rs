//! Secret wrappers for consistent secret handling.
//!
//! Decrypted material (DEKs, KEKs, seeds, scalars) travels as
//! [`SecretBytes`] so plaintext never transits as a bare buffer; the inner
//! value is only reachable through `expose_secret()` and is zeroized on
//! drop. When a buffer must be mutated in place, [`wipe`] clears it
//! deterministically.

use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroize;

/// A secret byte buffer that is zeroized on drop.
///
/// The inner value is only reachable through `expose_secret()`.
pub type SecretBytes = SecretBox<Vec<u8>>;

/// Build a [`SecretBytes`] from an owned buffer.
pub fn secret_bytes(bytes: Vec<u8>) -> SecretBytes {
    SecretBox::new(Box::new(bytes))
}

/// Copy a secret into a new box.
///
/// Secret copies are deliberate: call sites that must hand owned material
/// to another task go through this, and both copies wipe on drop.
pub fn clone_secret(secret: &SecretBytes) -> SecretBytes {
    secret_bytes(secret.expose_secret().clone())
}

/// Zero a byte buffer in place.
pub fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_bytes_expose() {
        let secret = secret_bytes(vec![1, 2, 3]);
        assert_eq!(secret.expose_secret(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_clone_secret_is_independent() {
        let secret = secret_bytes(vec![7; 16]);
        let copy = clone_secret(&secret);
        drop(secret);
        assert_eq!(copy.expose_secret(), &vec![7; 16]);
    }

    #[test]
    fn test_wipe_clears_buffer() {
        let mut buf = vec![0xAB; 32];
        wipe(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }
}
