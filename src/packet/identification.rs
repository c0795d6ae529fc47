//! Packet identifications.
//!
//! An identification is the only key used to route a packet to its handler.
//! The built-in set is closed and versioned together with
//! [`PROTOCOL_VERSION`](crate::packet::PROTOCOL_VERSION); custom
//! identifications may be added by embedders as long as they do not collide.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

/// Stable string key naming a packet type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketIdentification(Cow<'static, str>);

impl PacketIdentification {
    /// Loader → proxy: join a family.
    pub const REGISTER_SERVER: Self = Self(Cow::Borrowed("REGISTER_SERVER"));
    /// Loader → proxy: leave the family.
    pub const DEREGISTER: Self = Self(Cow::Borrowed("DEREGISTER"));
    /// Either direction: exclude a server from routing.
    pub const LOCK_SERVER: Self = Self(Cow::Borrowed("LOCK_SERVER"));
    /// Either direction: make a server routable again.
    pub const UNLOCK_SERVER: Self = Self(Cow::Borrowed("UNLOCK_SERVER"));
    /// Loader → proxy: liveness signal, optionally with a player count.
    pub const HEARTBEAT: Self = Self(Cow::Borrowed("HEARTBEAT"));
    /// Proxy → loader: registration admitted.
    pub const REGISTRATION_ACCEPTED: Self = Self(Cow::Borrowed("REGISTRATION_ACCEPTED"));
    /// Proxy → loader: registration refused.
    pub const REGISTRATION_REJECTED: Self = Self(Cow::Borrowed("REGISTRATION_REJECTED"));
    /// Proxy → loader: heartbeat from an unknown session, register again.
    pub const STALE_PING: Self = Self(Cow::Borrowed("STALE_PING"));
    /// Loader → proxy: move a player to another family.
    pub const SEND_PLAYER: Self = Self(Cow::Borrowed("SEND_PLAYER"));

    /// Every identification defined by this protocol version.
    pub const BUILTIN: [Self; 9] = [
        Self::REGISTER_SERVER,
        Self::DEREGISTER,
        Self::LOCK_SERVER,
        Self::UNLOCK_SERVER,
        Self::HEARTBEAT,
        Self::REGISTRATION_ACCEPTED,
        Self::REGISTRATION_REJECTED,
        Self::STALE_PING,
        Self::SEND_PLAYER,
    ];

    /// Create an embedder-defined identification.
    ///
    /// Names are normalised to upper case and must not collide with a
    /// built-in identification.
    pub fn custom(name: impl Into<String>) -> Result<Self, PacketError> {
        let name: String = name.into();
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() {
            return Err(PacketError::EmptyIdentification);
        }
        if Self::BUILTIN.iter().any(|b| b.as_str() == name) {
            return Err(PacketError::IdentificationCollision(name));
        }
        Ok(Self(Cow::Owned(name)))
    }

    /// Identification as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identification belongs to the built-in set.
    pub fn is_builtin(&self) -> bool {
        Self::BUILTIN.iter().any(|b| b == self)
    }

    /// Parse a wire identification without collision checks.
    pub(crate) fn from_wire(name: String) -> Self {
        match Self::BUILTIN.iter().find(|b| b.as_str() == name) {
            Some(builtin) => builtin.clone(),
            None => Self(Cow::Owned(name)),
        }
    }
}

impl fmt::Display for PacketIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_rejects_builtin_names() {
        let err = PacketIdentification::custom("lock_server").unwrap_err();
        assert!(matches!(err, PacketError::IdentificationCollision(name) if name == "LOCK_SERVER"));
        assert!(matches!(
            PacketIdentification::custom("  "),
            Err(PacketError::EmptyIdentification)
        ));
    }

    #[test]
    fn test_custom_identification() {
        let id = PacketIdentification::custom("party_invite").unwrap();
        assert_eq!(id.as_str(), "PARTY_INVITE");
        assert!(!id.is_builtin());
        assert!(PacketIdentification::HEARTBEAT.is_builtin());
    }

    #[test]
    fn test_wire_names_resolve_to_builtins() {
        let id = PacketIdentification::from_wire("UNLOCK_SERVER".to_string());
        assert_eq!(id, PacketIdentification::UNLOCK_SERVER);
        assert_eq!(id.to_string(), "UNLOCK_SERVER");
    }
}
