//! Shared pub/sub channel.
//!
//! # Data Flow
//! ```text
//! publish(text)
//!     → Connected:       delivered to every subscriber (publisher included)
//!     → not Connected:   outbox (Queue) or TransportError::Disconnected (FailFast)
//!
//! subscribe()
//!     → broadcast receiver of every message on the channel
//!     → filtering by target/identification happens above this layer
//! ```
//!
//! # Design Decisions
//! - Fire-and-forget: no acknowledgements, no cross-publisher ordering
//! - Messages from one publisher are delivered in publish order
//! - Reconnection is internal; callers only observe `ConnectionState`
//! - A publish is either accepted (sent or queued) or fails visibly

pub mod memory;
pub mod outbox;
pub mod relay;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::error::TransportError;

pub use memory::MemoryBus;
pub use relay::BusRelay;
pub use tcp::TcpBus;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcast channel shared by the proxy and every loader.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Channel name, for logging.
    fn channel(&self) -> &str;

    /// Publish one serialized packet.
    async fn publish(&self, message: String) -> Result<(), TransportError>;

    /// Receive every message published on the channel from now on.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Observe connection state transitions.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}
