//! Signing payload validation.
//!
//! The validator is pure and stateless: it reads the leading kind byte and
//! the protocol-defined watermark positions, and hands back the kind,
//! level, and round. The bytes to sign are always the full payload.
//!
//! Watermark positions:
//!
//! ```text
//! block (0x11):            tag(1) level(u64 BE) round(u32 BE) ...
//! preattestation (0x12):   tag(1) chain_id(4) level(u64 BE) round(u32 BE) ...
//! attestation (0x13):      tag(1) chain_id(4) level(u64 BE) round(u32 BE) ...
//! ```

use crate::error::KeychainError;
use crate::watermark::SignKind;

/// Minimum payload length for a block.
const BLOCK_MIN_LEN: usize = 1 + 8 + 4;
/// Minimum payload length for a consensus operation.
const CONSENSUS_OP_MIN_LEN: usize = 1 + 4 + 8 + 4;

/// Outcome of payload validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPayload {
    pub kind: SignKind,
    pub level: u64,
    pub round: u32,
}

/// Validate a signing payload and extract its watermark position.
pub fn validate_sign_payload(raw: &[u8]) -> Result<ValidatedPayload, KeychainError> {
    let tag = *raw.first().ok_or(KeychainError::BadPayload)?;
    let kind = SignKind::from_tag(tag).ok_or(KeychainError::BadPayload)?;

    let (level_at, min_len) = match kind {
        SignKind::Block => (1, BLOCK_MIN_LEN),
        SignKind::Preattestation | SignKind::Attestation => (5, CONSENSUS_OP_MIN_LEN),
    };
    if raw.len() < min_len {
        return Err(KeychainError::BadPayload);
    }

    let level = u64::from_be_bytes(
        raw[level_at..level_at + 8]
            .try_into()
            .map_err(|_| KeychainError::BadPayload)?,
    );
    let round_at = level_at + 8;
    let round = u32::from_be_bytes(
        raw[round_at..round_at + 4]
            .try_into()
            .map_err(|_| KeychainError::BadPayload)?,
    );

    Ok(ValidatedPayload { kind, level, round })
}

/// Build a minimal well-formed payload, used by tests and tooling.
pub fn build_payload(kind: SignKind, level: u64, round: u32, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONSENSUS_OP_MIN_LEN + rest.len());
    out.push(kind.tag());
    if kind != SignKind::Block {
        out.extend_from_slice(&[0u8; 4]); // chain id
    }
    out.extend_from_slice(&level.to_be_bytes());
    out.extend_from_slice(&round.to_be_bytes());
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_payload() {
        let raw = build_payload(SignKind::Block, 42, 7, b"header bytes");
        let v = validate_sign_payload(&raw).unwrap();
        assert_eq!(v.kind, SignKind::Block);
        assert_eq!(v.level, 42);
        assert_eq!(v.round, 7);
    }

    #[test]
    fn test_consensus_op_payloads() {
        for kind in [SignKind::Preattestation, SignKind::Attestation] {
            let raw = build_payload(kind, 1000, 2, &[0xEE; 32]);
            let v = validate_sign_payload(&raw).unwrap();
            assert_eq!(v.kind, kind);
            assert_eq!(v.level, 1000);
            assert_eq!(v.round, 2);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        for tag in [0x00u8, 0x10, 0x14, 0xFF] {
            let mut raw = vec![tag];
            raw.extend_from_slice(&[0u8; 20]);
            assert!(matches!(
                validate_sign_payload(&raw),
                Err(KeychainError::BadPayload)
            ));
        }
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let raw = build_payload(SignKind::Attestation, 5, 0, &[]);
        assert!(validate_sign_payload(&raw).is_ok());
        assert!(matches!(
            validate_sign_payload(&raw[..raw.len() - 1]),
            Err(KeychainError::BadPayload)
        ));
        assert!(matches!(
            validate_sign_payload(&[]),
            Err(KeychainError::BadPayload)
        ));
    }
}
