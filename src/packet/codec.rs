//! Packet serialization to and from transport text.
//!
//! The wire form is a single line of JSON. Unknown top-level fields are
//! ignored so newer peers can add metadata without breaking older ones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PacketError;
use crate::packet::envelope::{Packet, PacketState, Target};
use crate::packet::identification::PacketIdentification;
use crate::packet::payload::Payload;
use crate::packet::signing::{decode_signature, decode_verifying_key, encode_signature, encode_verifying_key};
use crate::packet::PROTOCOL_VERSION;

#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    id: Uuid,
    version: u16,
    identification: String,
    sender: Uuid,
    target: Target,
    #[serde(default)]
    payload: Payload,
    sent_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Encode a signed packet as transport text.
pub fn encode(packet: &Packet) -> Result<String, PacketError> {
    let (Some(signer), Some(signature)) = (packet.signer.as_ref(), packet.signature.as_ref()) else {
        return Err(PacketError::Unsigned);
    };
    let wire = WirePacket {
        id: packet.id,
        version: packet.version,
        identification: packet.identification.as_str().to_string(),
        sender: packet.sender,
        target: packet.target,
        payload: packet.payload.clone(),
        sent_at: packet.sent_at,
        signer: Some(encode_verifying_key(signer)),
        signature: Some(encode_signature(signature)),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Decode transport text into a received packet.
///
/// Signature bytes are parsed but not verified here; a packet with missing
/// signature fields still decodes so verification can reject it with a
/// precise reason.
pub fn decode(text: &str) -> Result<Packet, PacketError> {
    let wire: WirePacket = serde_json::from_str(text)?;
    if wire.version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion {
            found: wire.version,
            expected: PROTOCOL_VERSION,
        });
    }
    if wire.identification.is_empty() {
        return Err(PacketError::EmptyIdentification);
    }

    let signer = match wire.signer {
        Some(text) => Some(
            decode_verifying_key(&text)
                .map_err(|e| PacketError::Malformed(format!("signer: {}", e)))?,
        ),
        None => None,
    };
    let signature = match wire.signature {
        Some(text) => Some(
            decode_signature(&text)
                .ok_or_else(|| PacketError::Malformed("signature: invalid encoding".to_string()))?,
        ),
        None => None,
    };

    Ok(Packet {
        id: wire.id,
        version: wire.version,
        identification: PacketIdentification::from_wire(wire.identification),
        sender: wire.sender,
        target: wire.target,
        payload: wire.payload,
        sent_at: wire.sent_at,
        signer,
        signature,
        state: PacketState::Received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerificationError;
    use crate::packet::signing::LinkKey;

    fn signed_register(key: &LinkKey) -> Packet {
        let mut packet = Packet::builder(Uuid::new_v4())
            .identification(PacketIdentification::REGISTER_SERVER)
            .payload("family", "lobby")
            .payload("weight", 2)
            .payload("address", "10.0.0.4:25565")
            .build()
            .unwrap();
        packet.sign(key).unwrap();
        packet
    }

    #[test]
    fn test_decoded_packet_is_received_and_verifies() {
        let key = LinkKey::generate();
        let packet = signed_register(&key);
        let text = encode(&packet).unwrap();

        let received = decode(&text).unwrap();
        assert_eq!(received.state(), PacketState::Received);
        assert_eq!(received, packet);
        assert_eq!(received.identification(), &PacketIdentification::REGISTER_SERVER);
        assert_eq!(received.payload().get_str("family"), Some("lobby"));
        assert!(received.verify(&key.verifying_key()).is_ok());
        assert_eq!(received.verify_self_signed().unwrap(), key.verifying_key());
    }

    #[test]
    fn test_tampered_text_fails_verification() {
        let key = LinkKey::generate();
        let text = encode(&signed_register(&key)).unwrap();
        let tampered = text.replace("\"lobby\"", "\"survival\"");
        assert_ne!(text, tampered);

        let received = decode(&tampered).unwrap();
        assert_eq!(
            received.verify(&key.verifying_key()),
            Err(VerificationError::BadSignature)
        );
        assert!(received.verify_self_signed().is_err());
    }

    #[test]
    fn test_unsigned_packets_are_not_encoded() {
        let packet = Packet::builder(Uuid::new_v4())
            .identification(PacketIdentification::HEARTBEAT)
            .build()
            .unwrap();
        assert!(matches!(encode(&packet), Err(PacketError::Unsigned)));
    }

    #[test]
    fn test_malformed_and_foreign_versions() {
        assert!(matches!(decode("{not json"), Err(PacketError::Malformed(_))));

        let key = LinkKey::generate();
        let text = encode(&signed_register(&key)).unwrap();
        let future = text.replace("\"version\":1", "\"version\":99");
        assert!(matches!(
            decode(&future),
            Err(PacketError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let key = LinkKey::generate();
        let text = encode(&signed_register(&key)).unwrap();
        let extended = text.replacen('{', "{\"trace\":\"abc\",", 1);
        let received = decode(&extended).unwrap();
        assert!(received.verify(&key.verifying_key()).is_ok());
    }

    #[test]
    fn test_missing_signature_decodes_but_does_not_verify() {
        let key = LinkKey::generate();
        let text = format!(
            r#"{{"id":"{}","version":1,"identification":"HEARTBEAT","sender":"{}","target":{{"kind":"proxy"}},"sent_at":1}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let received = decode(&text).unwrap();
        assert_eq!(
            received.verify(&key.verifying_key()),
            Err(VerificationError::MissingSignature)
        );
    }
}
