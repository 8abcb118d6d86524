//! Property tests for the frame codec: roundtrip fidelity, resync under
//! injected noise, and progress under arbitrary chunking.

use bytes::BytesMut;
use proptest::prelude::*;
use vaultsign_wire::{decode_frame, encode_frame, DecodeStep, Frame, FrameKind, Stash};

fn arb_kind() -> impl Strategy<Value = FrameKind> {
    prop_oneof![
        Just(FrameKind::Request),
        Just(FrameKind::Response),
        Just(FrameKind::Accept),
        Just(FrameKind::Retry),
    ]
}

fn arb_frame() -> impl Strategy<Value = (FrameKind, [u8; 16], Vec<u8>)> {
    (
        arb_kind(),
        any::<[u8; 16]>(),
        proptest::collection::vec(any::<u8>(), 0..2048),
    )
}

fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
    let mut out = Vec::new();
    loop {
        match decode_frame(buf) {
            Ok(DecodeStep::Frame(f)) => out.push(f),
            Ok(DecodeStep::NeedMore) => return out,
            Err(_) => continue,
        }
    }
}

proptest! {
    #[test]
    fn roundtrip((kind, id, payload) in arb_frame()) {
        let mut buf = BytesMut::new();
        encode_frame(kind, &id, &payload, &mut buf).unwrap();
        let frames = decode_all(&mut buf);
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].kind, kind);
        prop_assert_eq!(frames[0].id, id);
        prop_assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn frames_survive_interstitial_noise(
        (kind_a, id_a, payload_a) in arb_frame(),
        (kind_b, id_b, payload_b) in arb_frame(),
        noise in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut wire = BytesMut::new();
        encode_frame(kind_a, &id_a, &payload_a, &mut wire).unwrap();
        wire.extend_from_slice(&noise);
        encode_frame(kind_b, &id_b, &payload_b, &mut wire).unwrap();

        let frames = decode_all(&mut wire);
        // The first frame always decodes; the noise may by chance contain a
        // parseable frame, so only check the two real ones are present in
        // order.
        prop_assert!(frames.len() >= 2 || noise.is_empty());
        prop_assert_eq!(frames[0].id, id_a);
        prop_assert_eq!(&frames[0].payload[..], &payload_a[..]);
        let last = frames.last().unwrap();
        // The second real frame arrives intact after the noise, so the
        // last decoded frame is it.
        prop_assert_eq!(last.id, id_b);
        prop_assert_eq!(&last.payload[..], &payload_b[..]);
    }

    #[test]
    fn arbitrary_chunking_is_equivalent(
        (kind, id, payload) in arb_frame(),
        cut in 1usize..64,
    ) {
        let mut wire = BytesMut::new();
        encode_frame(kind, &id, &payload, &mut wire).unwrap();

        let mut stash = Stash::new(wire.len() * 2);
        let mut decoded = Vec::new();
        for chunk in wire.chunks(cut) {
            stash.write(chunk);
            while let Some(frame) = stash.read_frame() {
                decoded.push(frame);
            }
        }
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(decoded[0].id, id);
        prop_assert_eq!(&decoded[0].payload[..], &payload[..]);
    }

    #[test]
    fn decoder_never_stalls_on_garbage(garbage in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut buf = BytesMut::from(&garbage[..]);
        // Every step must make progress: bounded iterations suffice to
        // drain arbitrary garbage down to a partial-frame remainder.
        let mut steps = 0usize;
        loop {
            let before = buf.len();
            match decode_frame(&mut buf) {
                Ok(DecodeStep::Frame(_)) => {}
                Ok(DecodeStep::NeedMore) => break,
                Err(_) => {}
            }
            prop_assert!(buf.len() < before || before == 0);
            steps += 1;
            prop_assert!(steps <= garbage.len() + 1);
        }
    }
}
