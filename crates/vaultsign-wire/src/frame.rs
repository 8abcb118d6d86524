//! Frame codec for the VaultSign wire protocol.
//!
//! Wire format (big-endian where multi-byte):
//!
//! ```text
//! offset  size  field
//! 0       4     magic      = b"VSG1"
//! 4       1     kind       (0x01..0x04)
//! 5       1     parity     (XOR of all other header bytes)
//! 6       2     reserved   (zero)
//! 8       16    id
//! 24      4     payload length (u32, big-endian)
//! 28      N     payload
//! ```
//!
//! The decoder is total: every invocation either emits a frame, reports
//! that more bytes are needed, or advances the read cursor by at least one
//! byte. Corruption (bad parity, impossible length, unknown kind) skips
//! past the magic and rescans, so a receiver always makes progress under
//! adversarial noise.

use crate::error::{DecodeError, EncodeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Protocol magic, first four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"VSG1";

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 28;

/// Maximum frame payload (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Offset of the parity byte within the header.
const PARITY_OFFSET: usize = 5;

/// Opaque 16-byte request correlator.
pub type FrameId = [u8; 16];

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries a request payload; the receiver must answer with a Response
    /// bearing the same id.
    Request = 0x01,
    /// Carries the response payload for a previously seen Request id.
    Response = 0x02,
    /// Signals that a Request id was admitted for processing; cancels
    /// retransmission on the sender side. Empty payload.
    Accept = 0x03,
    /// Signals that the sender lost state and all unacknowledged Requests
    /// must be retransmitted. Empty payload, zero id.
    Retry = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            0x03 => Ok(FrameKind::Accept),
            0x04 => Ok(FrameKind::Retry),
            other => Err(other),
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Correlator id; zero for Retry frames.
    pub id: FrameId,
    /// Payload bytes; empty for Accept and Retry.
    pub payload: Bytes,
}

/// Outcome of a successful decoder step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// A complete frame was decoded and consumed.
    Frame(Frame),
    /// Not enough buffered bytes for a header or the declared payload.
    NeedMore,
}

/// Encode a frame into `dst`, appending header and payload.
pub fn encode_frame(
    kind: FrameKind,
    id: &FrameId,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), EncodeError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge(payload.len()));
    }

    dst.reserve(HEADER_LEN + payload.len());
    let start = dst.len();
    dst.put_slice(&MAGIC);
    dst.put_u8(kind as u8);
    dst.put_u8(0); // parity, filled below
    dst.put_u16(0); // reserved
    dst.put_slice(id);
    dst.put_u32(payload.len() as u32);

    // The placeholder is zero, so XOR over the whole header equals XOR over
    // everything but the parity byte.
    let parity = dst[start..start + HEADER_LEN]
        .iter()
        .fold(0u8, |acc, b| acc ^ b);
    dst[start + PARITY_OFFSET] = parity;

    dst.put_slice(payload);
    Ok(())
}

/// Encode a frame into a fixed destination buffer, returning the number of
/// bytes written.
pub fn encode_frame_into(
    kind: FrameKind,
    id: &FrameId,
    payload: &[u8],
    dst: &mut [u8],
) -> Result<usize, EncodeError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge(payload.len()));
    }
    let need = HEADER_LEN + payload.len();
    if dst.len() < need {
        return Err(EncodeError::DstTooSmall {
            need,
            have: dst.len(),
        });
    }

    dst[0..4].copy_from_slice(&MAGIC);
    dst[4] = kind as u8;
    dst[5] = 0;
    dst[6] = 0;
    dst[7] = 0;
    dst[8..24].copy_from_slice(id);
    dst[24..28].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let parity = dst[..HEADER_LEN].iter().fold(0u8, |acc, b| acc ^ b);
    dst[PARITY_OFFSET] = parity;
    dst[HEADER_LEN..need].copy_from_slice(payload);
    Ok(need)
}

/// Encode a frame into a freshly allocated, right-sized buffer.
pub fn frame_bytes(kind: FrameKind, id: &FrameId, payload: &[u8]) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(kind, id, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Run one step of the streaming decoder against `src`.
///
/// On `Err`, the cursor has already been advanced past the bad magic;
/// calling again resumes the scan at the next byte.
pub fn decode_frame(src: &mut BytesMut) -> Result<DecodeStep, DecodeError> {
    // 1. Scan forward for the magic; bytes before it are noise.
    let Some(pos) = find_magic(src) else {
        // No magic anywhere. Keep a possible magic prefix at the tail,
        // discard the rest.
        let keep = src.len().min(MAGIC.len() - 1);
        let noise = src.len() - keep;
        if noise > 0 {
            trace!(bytes = noise, "discarding noise before magic");
            src.advance(noise);
        }
        return Ok(DecodeStep::NeedMore);
    };
    if pos > 0 {
        trace!(bytes = pos, "resync: discarding bytes before magic");
        src.advance(pos);
    }

    // 2. Wait for a full header.
    if src.len() < HEADER_LEN {
        return Ok(DecodeStep::NeedMore);
    }

    // 3. Parity over every header byte except the parity byte itself.
    let parity = src[..HEADER_LEN]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != PARITY_OFFSET)
        .fold(0u8, |acc, (_, b)| acc ^ b);
    if parity != src[PARITY_OFFSET] {
        src.advance(MAGIC.len());
        return Err(DecodeError::BadParity);
    }

    let kind_byte = src[4];
    let mut id = [0u8; 16];
    id.copy_from_slice(&src[8..24]);
    let len = u32::from_be_bytes([src[24], src[25], src[26], src[27]]) as usize;

    // 4. An impossible length means the header is garbage that happened to
    //    carry valid parity; treat as corruption.
    if len > MAX_PAYLOAD {
        src.advance(MAGIC.len());
        return Err(DecodeError::InvalidPayloadSize(len));
    }

    let kind = match FrameKind::try_from(kind_byte) {
        Ok(kind) => kind,
        Err(byte) => {
            src.advance(MAGIC.len());
            return Err(DecodeError::UnknownKind(byte));
        }
    };

    // 5. Wait for the full payload.
    if src.len() < HEADER_LEN + len {
        return Ok(DecodeStep::NeedMore);
    }

    // 6. Emit and consume.
    src.advance(HEADER_LEN);
    let payload = src.split_to(len).freeze();
    Ok(DecodeStep::Frame(Frame { kind, id, payload }))
}

fn find_magic(src: &[u8]) -> Option<usize> {
    if src.len() < MAGIC.len() {
        return None;
    }
    src.windows(MAGIC.len()).position(|w| w == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> FrameId {
        [byte; 16]
    }

    fn decode_all(src: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match decode_frame(src) {
                Ok(DecodeStep::Frame(f)) => frames.push(f),
                Ok(DecodeStep::NeedMore) => return frames,
                Err(_) => continue,
            }
        }
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for (kind, payload) in [
            (FrameKind::Request, &b"hello"[..]),
            (FrameKind::Response, &b""[..]),
            (FrameKind::Accept, &b""[..]),
            (FrameKind::Retry, &b""[..]),
        ] {
            let mut buf = BytesMut::new();
            encode_frame(kind, &id(7), payload, &mut buf).unwrap();

            let step = decode_frame(&mut buf).unwrap();
            match step {
                DecodeStep::Frame(f) => {
                    assert_eq!(f.kind, kind);
                    assert_eq!(f.id, id(7));
                    assert_eq!(&f.payload[..], payload);
                }
                other => panic!("expected frame, got {:?}", other),
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_header_split_across_reads() {
        let mut encoded = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), b"payload", &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..12]);
        assert_eq!(decode_frame(&mut buf).unwrap(), DecodeStep::NeedMore);

        buf.extend_from_slice(&encoded[12..]);
        match decode_frame(&mut buf).unwrap() {
            DecodeStep::Frame(f) => assert_eq!(&f.payload[..], b"payload"),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_split_mid_stream() {
        let mut encoded = BytesMut::new();
        encode_frame(FrameKind::Response, &id(2), &[0xAA; 100], &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..HEADER_LEN + 40]);
        assert_eq!(decode_frame(&mut buf).unwrap(), DecodeStep::NeedMore);

        buf.extend_from_slice(&encoded[HEADER_LEN + 40..]);
        match decode_frame(&mut buf).unwrap() {
            DecodeStep::Frame(f) => assert_eq!(f.payload.len(), 100),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_resync_through_garbage() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), b"first", &mut buf).unwrap();
        // 128 bytes of noise that deliberately contains no magic.
        buf.extend_from_slice(&[0x55; 128]);
        encode_frame(FrameKind::Request, &id(2), b"second", &mut buf).unwrap();

        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"first");
        assert_eq!(&frames[1].payload[..], b"second");
    }

    #[test]
    fn test_parity_corruption_skips_frame() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), b"lost", &mut buf).unwrap();
        encode_frame(FrameKind::Request, &id(2), b"kept", &mut buf).unwrap();
        buf[10] ^= 0x01; // flip one id bit in the first header

        assert_eq!(decode_frame(&mut buf), Err(DecodeError::BadParity));
        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"kept");
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), b"x", &mut buf).unwrap();
        // Forge an oversized length and recompute parity so the length
        // check, not the parity check, rejects it.
        buf[24..28].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        let parity = buf[..HEADER_LEN]
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != PARITY_OFFSET)
            .fold(0u8, |acc, (_, b)| acc ^ b);
        buf[PARITY_OFFSET] = parity;

        match decode_frame(&mut buf) {
            Err(DecodeError::InvalidPayloadSize(n)) => assert_eq!(n, MAX_PAYLOAD + 1),
            other => panic!("expected InvalidPayloadSize, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_resyncs() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), b"", &mut buf).unwrap();
        // Swap the kind byte and fix parity accordingly.
        buf[4] = 0x09;
        let parity = buf[..HEADER_LEN]
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != PARITY_OFFSET)
            .fold(0u8, |acc, (_, b)| acc ^ b);
        buf[PARITY_OFFSET] = parity;

        assert_eq!(decode_frame(&mut buf), Err(DecodeError::UnknownKind(0x09)));
    }

    #[test]
    fn test_max_payload_boundary() {
        let payload = vec![0u8; MAX_PAYLOAD];
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, &id(1), &payload, &mut buf).unwrap();
        match decode_frame(&mut buf).unwrap() {
            DecodeStep::Frame(f) => assert_eq!(f.payload.len(), MAX_PAYLOAD),
            other => panic!("expected frame, got {:?}", other),
        }

        let too_big = vec![0u8; MAX_PAYLOAD + 1];
        let err = encode_frame(FrameKind::Request, &id(1), &too_big, &mut buf).unwrap_err();
        assert_eq!(err, EncodeError::PayloadTooLarge(MAX_PAYLOAD + 1));
    }

    #[test]
    fn test_encode_into_dst_too_small() {
        let mut dst = [0u8; HEADER_LEN + 3];
        let err = encode_frame_into(FrameKind::Request, &id(1), b"long payload", &mut dst)
            .unwrap_err();
        assert!(matches!(err, EncodeError::DstTooSmall { .. }));

        let n = encode_frame_into(FrameKind::Request, &id(1), b"abc", &mut dst).unwrap();
        assert_eq!(n, HEADER_LEN + 3);
    }

    #[test]
    fn test_noise_only_keeps_possible_magic_prefix() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00; 64]);
        buf.extend_from_slice(&MAGIC[..2]);
        assert_eq!(decode_frame(&mut buf).unwrap(), DecodeStep::NeedMore);
        // Only a potential magic prefix survives the scan.
        assert!(buf.len() <= MAGIC.len() - 1);
    }
}
