//! Magic link packet protocol.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     Packet::builder(sender)
//!     → identification / target / payload
//!     → build()            (Sendable, fresh correlation id + sent_at)
//!     → sign(key)          (Signed; second call is AlreadySigned)
//!     → codec::encode      (single-line JSON)
//!     → transport publish  (Sent)
//!
//! Inbound:
//!     transport text
//!     → codec::decode      (Received, or MalformedPacket)
//!     → verify(key)        (or VerificationFailure, dropped)
//!     → registry.dispatch  (by identification; unknown → dropped)
//! ```
//!
//! # Design Decisions
//! - Identification is the only routing key; no handler hierarchy
//! - The signature covers every field except itself, so any edit after
//!   signing invalidates the packet
//! - Payloads are flat maps of primitives so schema evolution is additive

pub mod codec;
pub mod envelope;
pub mod identification;
pub mod payload;
pub mod registry;
pub mod signing;

pub use envelope::{now_millis, Packet, PacketBuilder, PacketState, SignOutcome, Target};
pub use identification::PacketIdentification;
pub use payload::{Payload, PayloadValue};
pub use registry::{Dispatch, PacketRegistry};
pub use signing::{KeyRing, LinkKey};

/// Version of the built-in identification set and wire layout.
pub const PROTOCOL_VERSION: u16 = 1;
