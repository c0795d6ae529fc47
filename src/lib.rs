//! RustyConnector magic link library
//!
//! Control plane between a game-network proxy and its backend servers
//! ("loaders"): signed packets over a shared pub/sub channel, loader
//! sessions with heartbeat liveness, a family tree with capped membership
//! and weighted selection, and a scaling clock that recommends capacity
//! changes.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod family;
pub mod lifecycle;
pub mod link;
pub mod load_balancer;
pub mod observability;
pub mod packet;
pub mod player;
pub mod proxy;
pub mod resilience;
pub mod scaling;
pub mod transport;

pub use config::schema::LinkConfig;
pub use error::{LinkError, Result};
pub use events::{EventBus, ProxyEvent};
pub use lifecycle::Shutdown;
pub use link::{LoaderLink, LoaderSettings};
pub use proxy::Proxy;
