//! The packet envelope and its builder.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacketError, VerificationError};
use crate::packet::identification::PacketIdentification;
use crate::packet::payload::{Payload, PayloadValue};
use crate::packet::signing::{self, LinkKey};
use crate::packet::PROTOCOL_VERSION;

/// Who a packet is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    /// The proxy.
    Proxy,
    /// One specific loader.
    Loader(Uuid),
    /// Every loader on the channel.
    Broadcast,
}

impl Target {
    /// Whether a loader with `loader_id` should accept this packet.
    pub fn addresses_loader(&self, loader_id: Uuid) -> bool {
        match self {
            Target::Proxy => false,
            Target::Loader(id) => *id == loader_id,
            Target::Broadcast => true,
        }
    }

    pub fn addresses_proxy(&self) -> bool {
        matches!(self, Target::Proxy)
    }
}

/// Where a packet is in its lifecycle.
///
/// ```text
/// Sendable ──sign──▶ Signed ──publish──▶ Sent
///                       ▲                  │
///                       └──prepare_resend──┘
/// Received (decoded from the wire, immutable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Sendable,
    Signed,
    Sent,
    Received,
}

/// Result of [`Packet::sign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutcome {
    /// The packet was signed by this call.
    Signed,
    /// The packet already carried a signature; nothing changed.
    AlreadySigned,
}

/// A magic link packet.
///
/// Identity is the correlation id: two packets are equal when their ids are,
/// regardless of content.
#[derive(Clone)]
pub struct Packet {
    pub(crate) id: Uuid,
    pub(crate) version: u16,
    pub(crate) identification: PacketIdentification,
    pub(crate) sender: Uuid,
    pub(crate) target: Target,
    pub(crate) payload: Payload,
    pub(crate) sent_at: u64,
    pub(crate) signer: Option<VerifyingKey>,
    pub(crate) signature: Option<Signature>,
    pub(crate) state: PacketState,
}

/// Fields covered by the signature, in canonical order.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a Uuid,
    version: u16,
    identification: &'a str,
    sender: &'a Uuid,
    target: &'a Target,
    payload: &'a Payload,
    sent_at: u64,
}

impl Packet {
    /// Start building a packet sent by `sender`.
    pub fn builder(sender: Uuid) -> PacketBuilder {
        PacketBuilder::new(sender)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn identification(&self) -> &PacketIdentification {
        &self.identification
    }

    pub fn sender(&self) -> Uuid {
        self.sender
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Send time in unix milliseconds.
    pub fn sent_at(&self) -> u64 {
        self.sent_at
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn signer(&self) -> Option<&VerifyingKey> {
        self.signer.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let fields = SignedFields {
            id: &self.id,
            version: self.version,
            identification: self.identification.as_str(),
            sender: &self.sender,
            target: &self.target,
            payload: &self.payload,
            sent_at: self.sent_at,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    /// Sign the packet with `key`.
    ///
    /// Signing is guarded: a packet that already carries a signature is left
    /// untouched and [`SignOutcome::AlreadySigned`] is returned, so resend
    /// attempts can call this unconditionally.
    pub fn sign(&mut self, key: &LinkKey) -> Result<SignOutcome, PacketError> {
        if self.signature.is_some() {
            return Ok(SignOutcome::AlreadySigned);
        }
        if self.state != PacketState::Sendable {
            return Err(PacketError::NotSendable(self.state));
        }
        let message = self.signing_bytes()?;
        self.signature = Some(key.sign(&message));
        self.signer = Some(key.verifying_key());
        self.state = PacketState::Signed;
        Ok(SignOutcome::Signed)
    }

    /// Verify the signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), VerificationError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(VerificationError::MissingSignature)?;
        let message = self
            .signing_bytes()
            .map_err(|_| VerificationError::BadSignature)?;
        signing::verify(key, &message, signature)
    }

    /// Verify against the key the packet claims to be signed with.
    ///
    /// Only meaningful once the caller has checked that key is trusted.
    pub fn verify_self_signed(&self) -> Result<VerifyingKey, VerificationError> {
        let signer = self.signer.ok_or(VerificationError::MissingSignature)?;
        self.verify(&signer)?;
        Ok(signer)
    }

    /// Transition `Signed → Sent`. Anything else is refused.
    pub(crate) fn mark_sent(&mut self) -> Result<(), PacketError> {
        match self.state {
            PacketState::Signed => {
                self.state = PacketState::Sent;
                Ok(())
            }
            PacketState::Sendable => Err(PacketError::Unsigned),
            other => Err(PacketError::NotSendable(other)),
        }
    }

    /// Re-arm a sent packet for another publish.
    ///
    /// The correlation id is kept, so a receiver that already processed the
    /// first copy suppresses the second one. The timestamp is refreshed and
    /// the packet re-signed with `key`.
    pub fn prepare_resend(&mut self, key: &LinkKey) -> Result<(), PacketError> {
        if self.state != PacketState::Sent {
            return Err(PacketError::NotSendable(self.state));
        }
        self.sent_at = now_millis();
        self.signature = None;
        self.signer = None;
        self.state = PacketState::Sendable;
        self.sign(key).map(|_| ())
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Packet {}

impl std::hash::Hash for Packet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("identification", &self.identification)
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("payload", &self.payload)
            .field("sent_at", &self.sent_at)
            .field("signed", &self.signature.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Builder for sendable packets.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    sender: Uuid,
    identification: Option<PacketIdentification>,
    target: Target,
    payload: Payload,
}

impl PacketBuilder {
    fn new(sender: Uuid) -> Self {
        Self {
            sender,
            identification: None,
            target: Target::Proxy,
            payload: Payload::new(),
        }
    }

    pub fn identification(mut self, identification: PacketIdentification) -> Self {
        self.identification = Some(identification);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Address the reply to whoever sent `packet`.
    pub fn reply_to(self, packet: &Packet) -> Self {
        let target = if packet.target.addresses_proxy() {
            Target::Loader(packet.sender)
        } else {
            Target::Proxy
        };
        self.target(target)
    }

    pub fn payload(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key, value);
        self
    }

    /// Finish the packet with a fresh correlation id and timestamp.
    pub fn build(self) -> Result<Packet, PacketError> {
        let identification = self
            .identification
            .ok_or(PacketError::EmptyIdentification)?;
        Ok(Packet {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            identification,
            sender: self.sender,
            target: self.target,
            payload: self.payload,
            sent_at: now_millis(),
            signer: None,
            signature: None,
            state: PacketState::Sendable,
        })
    }
}

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_packet(sender: Uuid) -> Packet {
        Packet::builder(sender)
            .identification(PacketIdentification::LOCK_SERVER)
            .target(Target::Proxy)
            .payload("reason", "maintenance")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let sender = Uuid::new_v4();
        let packet = lock_packet(sender);
        assert_eq!(packet.state(), PacketState::Sendable);
        assert_eq!(packet.sender(), sender);
        assert_eq!(packet.version(), PROTOCOL_VERSION);
        assert!(!packet.is_signed());
        assert!(packet.sent_at() > 0);
    }

    #[test]
    fn test_builder_requires_identification() {
        let result = Packet::builder(Uuid::new_v4()).build();
        assert!(matches!(result, Err(PacketError::EmptyIdentification)));
    }

    #[test]
    fn test_identity_is_correlation_id() {
        let sender = Uuid::new_v4();
        let a = lock_packet(sender);
        let b = lock_packet(sender);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_sign_is_guarded() {
        let key = LinkKey::generate();
        let mut packet = lock_packet(Uuid::new_v4());

        assert_eq!(packet.sign(&key).unwrap(), SignOutcome::Signed);
        assert_eq!(packet.sign(&key).unwrap(), SignOutcome::AlreadySigned);
        assert_eq!(packet.state(), PacketState::Signed);
        assert!(packet.verify(&key.verifying_key()).is_ok());
    }

    #[test]
    fn test_mutation_after_signing_fails_verification() {
        let key = LinkKey::generate();
        let mut packet = lock_packet(Uuid::new_v4());
        packet.sign(&key).unwrap();

        packet.payload.insert("reason", "tampered");
        assert_eq!(
            packet.verify(&key.verifying_key()),
            Err(VerificationError::BadSignature)
        );
        let other = LinkKey::generate();
        assert_eq!(
            packet.verify(&other.verifying_key()),
            Err(VerificationError::BadSignature)
        );
    }

    #[test]
    fn test_unsigned_packet_fails_verification() {
        let key = LinkKey::generate();
        let packet = lock_packet(Uuid::new_v4());
        assert_eq!(
            packet.verify(&key.verifying_key()),
            Err(VerificationError::MissingSignature)
        );
    }

    #[test]
    fn test_send_state_machine() {
        let key = LinkKey::generate();
        let mut packet = lock_packet(Uuid::new_v4());

        assert!(matches!(packet.mark_sent(), Err(PacketError::Unsigned)));
        packet.sign(&key).unwrap();
        packet.mark_sent().unwrap();
        assert!(matches!(
            packet.mark_sent(),
            Err(PacketError::NotSendable(PacketState::Sent))
        ));

        let id = packet.id();
        packet.prepare_resend(&key).unwrap();
        assert_eq!(packet.state(), PacketState::Signed);
        assert_eq!(packet.id(), id);
        assert!(packet.verify(&key.verifying_key()).is_ok());
        packet.mark_sent().unwrap();
    }

    #[test]
    fn test_reply_targets_original_sender() {
        let loader = Uuid::new_v4();
        let proxy = Uuid::new_v4();
        let request = lock_packet(loader);
        let reply = Packet::builder(proxy)
            .identification(PacketIdentification::REGISTRATION_ACCEPTED)
            .reply_to(&request)
            .build()
            .unwrap();
        assert_eq!(reply.target(), Target::Loader(loader));
        assert!(reply.target().addresses_loader(loader));
        assert!(!reply.target().addresses_loader(proxy));
    }
}
