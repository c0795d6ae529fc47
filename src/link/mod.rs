//! The magic link: sessions between the proxy and its loaders.
//!
//! # Responsibilities
//! - Carry signed packets over the shared bus (`channel`)
//! - Track one session per loader on the proxy (`sessions`)
//! - Answer the built-in loader packets on the proxy (`handlers`)
//! - Drive registration and heartbeats from a loader (`loader`)
//!
//! # Design Decisions
//! - Proxy and loader share `PacketChannel`; only the handlers and the key
//!   resolver differ
//! - Handlers reach the channel through a weak reference, the channel owns
//!   the registry that owns the handlers

pub mod channel;
pub mod handlers;
pub mod loader;
pub mod session;
pub mod sessions;

pub use channel::{KeyResolver, PacketChannel, Role};
pub use handlers::ProxyHandlers;
pub use loader::{LoaderLink, LoaderSettings};
pub use session::{MagicLinkSession, SessionState};
pub use sessions::{Begin, LivenessSweeper, SessionKeys, SessionRegistry};

use crate::config::schema::MagicLinkConfig;
use crate::error::LinkError;
use crate::packet::signing::PRIVATE_KEY_ENV_VAR;
use crate::packet::LinkKey;

/// Pick this node's signing key.
///
/// `RC_MAGICLINK_PRIVATE_KEY` wins over `link.private_key`. With neither, an
/// ephemeral key is generated; loaders will only trust it if they are told
/// its public half.
pub fn resolve_link_key(config: &MagicLinkConfig) -> Result<LinkKey, LinkError> {
    if let Some(key) = LinkKey::from_env() {
        tracing::debug!(source = PRIVATE_KEY_ENV_VAR, "Using signing key from environment");
        return Ok(key?);
    }
    if let Some(seed) = &config.private_key {
        return Ok(LinkKey::from_base64(seed)?);
    }
    let key = LinkKey::generate();
    tracing::warn!(
        public_key = %crate::packet::signing::encode_verifying_key(&key.verifying_key()),
        "No signing key configured, generated an ephemeral one"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_is_used() {
        if std::env::var(PRIVATE_KEY_ENV_VAR).is_ok() {
            return;
        }
        let key = LinkKey::generate();
        let config = MagicLinkConfig {
            private_key: Some(key.to_base64()),
            ..MagicLinkConfig::default()
        };
        let resolved = resolve_link_key(&config).unwrap();
        assert_eq!(resolved.verifying_key(), key.verifying_key());

        let bad = MagicLinkConfig {
            private_key: Some("nope".into()),
            ..MagicLinkConfig::default()
        };
        assert!(matches!(resolve_link_key(&bad), Err(LinkError::Verification(_))));
    }
}
