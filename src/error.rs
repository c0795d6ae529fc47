//! Error taxonomy for the magic link control plane.
//!
//! # Categories
//! - **Packet errors**: malformed wire text, bad identifications, invalid send state
//! - **Verification errors**: missing/unknown signer, bad signature, stale packet
//! - **Admission errors**: a loader could not join its family
//! - **Routing errors**: no server could be picked for a player
//! - **Transport errors**: the shared channel is down or saturated
//!
//! None of these terminate the process. Packet and verification errors are
//! logged and the message is dropped; admission errors are answered with a
//! rejection packet; routing and transport errors are returned to the caller.

use thiserror::Error;
use uuid::Uuid;

use crate::packet::PacketState;

/// Errors produced while building, encoding or decoding packets.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("packet identification `{0}` collides with a built-in identification")]
    IdentificationCollision(String),

    #[error("packet identification must not be empty")]
    EmptyIdentification,

    #[error("packet is not sendable in state {0:?}")]
    NotSendable(PacketState),

    #[error("packet must be signed before publishing")]
    Unsigned,

    #[error("missing payload field `{0}`")]
    MissingField(&'static str),

    #[error("payload field `{field}` has the wrong type (expected {expected})")]
    FieldType {
        field: &'static str,
        expected: &'static str,
    },
}

impl From<serde_json::Error> for PacketError {
    fn from(err: serde_json::Error) -> Self {
        PacketError::Malformed(err.to_string())
    }
}

/// Reasons a received packet failed authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("packet carries no signature")]
    MissingSignature,

    #[error("signer key is not trusted")]
    UnknownSigner,

    #[error("signer does not match the key pinned for sender {0}")]
    SignerMismatch(Uuid),

    #[error("signature is not valid for this packet")]
    BadSignature,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("packet {0} was already processed")]
    Replayed(Uuid),

    #[error("packet timestamp is outside the replay window")]
    Stale,
}

/// Why a registering loader was not admitted into a family.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("family `{family}` is at its hard cap of {hard_cap} servers")]
    HardCapExceeded { family: String, hard_cap: usize },

    #[error("unknown family `{0}`")]
    UnknownFamily(String),

    #[error("invalid registration: {0}")]
    InvalidRequest(String),
}

impl AdmissionError {
    /// Short machine-readable reason carried in rejection packets.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::HardCapExceeded { .. } => "HARD_CAP_EXCEEDED",
            AdmissionError::UnknownFamily(_) => "UNKNOWN_FAMILY",
            AdmissionError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Failures while placing a player on a server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no available server in family `{0}`")]
    NoAvailableServer(String),

    #[error("unknown family `{0}`")]
    UnknownFamily(String),

    #[error("player {0} is not whitelisted for family `{1}`")]
    NotWhitelisted(Uuid, String),

    #[error("player {0} is not online")]
    PlayerOffline(Uuid),

    #[error("unknown server {0}")]
    UnknownServer(Uuid),
}

/// Failures of the shared pub/sub channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("outbound queue is full ({0} messages)")]
    QueueFull(usize),

    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for link-level operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

/// Result alias for link-level operations.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_codes() {
        let err = AdmissionError::HardCapExceeded {
            family: "lobby".into(),
            hard_cap: 3,
        };
        assert_eq!(err.code(), "HARD_CAP_EXCEEDED");
        assert!(err.to_string().contains("lobby"));
        assert_eq!(AdmissionError::UnknownFamily("x".into()).code(), "UNKNOWN_FAMILY");
    }

    #[test]
    fn test_link_error_conversion() {
        let err: LinkError = TransportError::Disconnected.into();
        assert_eq!(err.to_string(), "transport disconnected");
    }
}
