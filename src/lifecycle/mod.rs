//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (Proxy::start / LoaderLink::start):
//!     Subscribe to bus → Spawn listener → Spawn liveness sweeper / heartbeat → Spawn scaling clock
//!
//! Shutdown (shutdown.rs):
//!     stop() or ctrl-c → trigger broadcast → every loop leaves its select! → Exit
//! ```
//!
//! # Design Decisions
//! - Every long-running task selects on a shutdown receiver
//! - start/stop are idempotent

pub mod shutdown;

pub use shutdown::Shutdown;
