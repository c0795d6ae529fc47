//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Transport connection lost:
//!     → backoff.rs (exponential delay + jitter per attempt)
//!     → reconnect attempt
//!     → success resets the attempt counter
//! ```

pub mod backoff;
