//! Framed request/response broker for the VaultSign USB link.
//!
//! The broker turns an unreliable byte pipe (USB bulk endpoints bounce
//! during rebinds and host reopens) into a duplex, connection-oriented
//! message transport: framing and resynchronization come from
//! `vaultsign-wire`; this crate adds idempotent delivery on retry and
//! pipelined concurrent requests, correlated purely by 16-byte ids.
//!
//! ```text
//! ┌──────────┐   Request/Response    ┌──────────┐
//! │   host   │ ◄───────────────────► │  gadget  │
//! │  broker  │   Accept / Retry      │  broker  │
//! └──────────┘                       └──────────┘
//! ```
//!
//! Both sides run the same engine: one read task, one write task, and a
//! handler invoked for each inbound request id at most once.

pub mod broker;
pub mod mem;
pub mod transport;

mod error;

pub use broker::{Broker, BrokerConfig, RequestHandler};
pub use error::BrokerError;
pub use mem::MemTransport;
pub use transport::{Transport, TransportError};
