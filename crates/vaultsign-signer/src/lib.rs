//! Signer-side request dispatch and host-side typed client.
//!
//! The [`Dispatcher`] runs on the gadget: it decodes each inbound request
//! payload, invokes the keychain or store, wipes passphrase material, and
//! encodes the tagged response. The [`SignerClient`] runs on the host: one
//! typed helper per request kind over the broker, with per-kind timeouts.

pub mod client;
pub mod dispatch;
pub mod logring;
pub mod throttle;

pub use client::{ClientError, SignerClient};
pub use dispatch::Dispatcher;
pub use logring::{LogRing, LogRingLayer};
pub use throttle::Throttle;
