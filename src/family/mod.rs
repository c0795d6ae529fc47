//! Families: named groups of servers sharing a load balancing policy.
//!
//! # Data Flow
//! ```text
//! REGISTER_SERVER → FamilyService::register_server
//!     → node.rs Family::admit (soft/hard cap, writer lock, snapshot swap)
//!     → server index updated → ServerRegistered / SoftCapBreached events
//!
//! Player routed → FamilyService::connect
//!     → root whitelist (whitelist.rs)
//!     → Family::select (snapshot → load balancer)
//!     → player registry assignment → Connected event
//!
//! DEREGISTER / timeout → FamilyService::unregister_server
//!     → Family::evict → displaced players caught or released
//! ```

pub mod matchmaking;
pub mod node;
pub mod server;
pub mod service;
pub mod whitelist;

pub use matchmaking::{Matchmaker, PlayerRank, RankedPlayer};
pub use node::{Admission, Family, LockTransition, Member};
pub use server::{LockState, ServerRecord, ServerRegistration};
pub use service::FamilyService;
pub use whitelist::{ConfiguredWhitelist, PermissionSource, Whitelist};
