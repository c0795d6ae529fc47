//! Key material for signing and verifying packets.
//!
//! # Security
//! - Signing keys come from configuration or the environment, never the wire
//! - Keys are never logged; `Debug` only shows the public half
//! - Verifying keys travel base64-encoded inside each packet, and receivers
//!   only accept the ones listed in their [`KeyRing`]

use std::collections::HashSet;
use std::fmt;

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::VerificationError;

/// Environment variable holding the base64 Ed25519 seed for this node.
pub const PRIVATE_KEY_ENV_VAR: &str = "RC_MAGICLINK_PRIVATE_KEY";

/// The private key a node signs its packets with.
#[derive(Clone)]
pub struct LinkKey {
    signing: SigningKey,
}

impl LinkKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Load a key from a base64-encoded 32 byte seed.
    pub fn from_base64(seed: &str) -> Result<Self, VerificationError> {
        let bytes = Base64
            .decode(seed.trim())
            .map_err(|e| VerificationError::InvalidKey(format!("invalid base64: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VerificationError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Load a key from [`PRIVATE_KEY_ENV_VAR`], if set.
    pub fn from_env() -> Option<Result<Self, VerificationError>> {
        std::env::var(PRIVATE_KEY_ENV_VAR)
            .ok()
            .map(|seed| Self::from_base64(&seed))
    }

    /// Seed encoded for configuration files.
    pub fn to_base64(&self) -> String {
        Base64.encode(self.signing.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkKey")
            .field("public", &encode_verifying_key(&self.verifying_key()))
            .finish()
    }
}

/// Base64 form of a verifying key, as used in packets and config files.
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    Base64.encode(key.as_bytes())
}

/// Parse a base64 verifying key.
pub fn decode_verifying_key(text: &str) -> Result<VerifyingKey, VerificationError> {
    let bytes = Base64
        .decode(text.trim())
        .map_err(|e| VerificationError::InvalidKey(format!("invalid base64: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VerificationError::InvalidKey("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| VerificationError::InvalidKey(e.to_string()))
}

pub(crate) fn encode_signature(signature: &Signature) -> String {
    Base64.encode(signature.to_bytes())
}

pub(crate) fn decode_signature(text: &str) -> Option<Signature> {
    let bytes = Base64.decode(text).ok()?;
    let bytes: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

pub(crate) fn verify(
    key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), VerificationError> {
    key.verify(message, signature)
        .map_err(|_| VerificationError::BadSignature)
}

/// Set of verifying keys a node accepts packets from.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    trusted: HashSet<[u8; 32]>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key ring from base64 verifying keys.
    pub fn from_encoded<'a>(
        keys: impl IntoIterator<Item = &'a String>,
    ) -> Result<Self, VerificationError> {
        let mut ring = Self::new();
        for key in keys {
            ring.trust(decode_verifying_key(key)?);
        }
        Ok(ring)
    }

    pub fn trust(&mut self, key: VerifyingKey) {
        self.trusted.insert(key.to_bytes());
    }

    pub fn is_trusted(&self, key: &VerifyingKey) -> bool {
        self.trusted.contains(key.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}
