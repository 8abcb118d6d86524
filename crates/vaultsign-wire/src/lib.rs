//! Wire framing for the VaultSign USB protocol.
//!
//! The USB bulk pipe between host and gadget is an unreliable byte stream:
//! it offers no sessions, no acks, and may deliver garbage while endpoints
//! rebind. This crate provides the two leaves the broker is built on:
//!
//! - [`frame`]: a bit-exact codec for the 28-byte-header frame format, with
//!   magic-scan resynchronization so corruption is never fatal;
//! - [`stash`]: a bounded reassembly buffer feeding the streaming decoder.
//!
//! Both are pure and synchronous; all I/O lives in `vaultsign-broker`.

pub mod frame;
pub mod stash;

mod error;

pub use error::{DecodeError, EncodeError};
pub use frame::{
    decode_frame, encode_frame, encode_frame_into, frame_bytes, DecodeStep, Frame, FrameId,
    FrameKind, HEADER_LEN, MAGIC, MAX_PAYLOAD,
};
pub use stash::Stash;
