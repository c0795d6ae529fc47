//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Map `ObservabilityConfig` onto an `EnvFilter` and output format
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - Compact format by default, pretty for local development
//! - A second initialization is ignored, so tests can call it freely

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::ObservabilityConfig;

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("rusty_connector={},warn", config.log_level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    installed.is_ok()
}
