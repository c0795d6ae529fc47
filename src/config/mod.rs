//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → LinkConfig (validated, immutable)
//!     → RC_MAGICLINK_PRIVATE_KEY overrides link.private_key
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Proxy::apply_config (new families, load balancer settings)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Key material comes from the environment first, the file second

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    Algorithm, Backpressure, FamilyConfig, LinkConfig, LoadBalancerConfig, TransportConfig,
    TransportKind, WhitelistConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
