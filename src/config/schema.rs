//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a magic link
//! node. All types derive Serde traits for deserialization from TOML files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Magic link identity, keys and liveness.
    pub link: MagicLinkConfig,

    /// Shared pub/sub channel settings.
    pub transport: TransportConfig,

    /// Dynamic scaling clock.
    pub scaling: ScalingConfig,

    /// Message cache and replay suppression.
    pub cache: CacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Family definitions.
    pub families: Vec<FamilyConfig>,
}

/// Magic link identity and liveness configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MagicLinkConfig {
    /// Shared channel name for this deployment.
    pub channel: String,

    /// Base64 Ed25519 seed. Overridden by `RC_MAGICLINK_PRIVATE_KEY`.
    pub private_key: Option<String>,

    /// Base64 verifying keys of loaders allowed to register.
    pub trusted_keys: Vec<String>,

    /// Expected heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// A session with no heartbeat for this long is timed out.
    pub liveness_timeout_secs: u64,

    /// How often the proxy sweeps sessions for liveness, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for MagicLinkConfig {
    fn default() -> Self {
        Self {
            channel: "rustyconnector".to_string(),
            private_key: None,
            trusted_keys: Vec::new(),
            heartbeat_interval_secs: 5,
            liveness_timeout_secs: 15,
            sweep_interval_ms: 1000,
        }
    }
}

/// Which transport implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process broadcast bus.
    #[default]
    Memory,
    /// Line-delimited JSON over TCP through a relay.
    Tcp,
}

/// What publishing does while the transport is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Hold messages (up to `queue_capacity`) and flush on reconnect.
    #[default]
    Queue,
    /// Fail the publish immediately.
    FailFast,
}

/// Shared channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// Relay address to connect to (tcp only).
    pub address: String,

    /// If set, this node also hosts the relay on this address.
    pub relay_bind: Option<String>,

    pub backpressure: Backpressure,

    /// Maximum messages held while disconnected.
    pub queue_capacity: usize,

    /// Reconnect backoff base in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Reconnect backoff ceiling in milliseconds.
    pub reconnect_max_delay_ms: u64,

    /// Broadcast buffer per subscriber before it starts lagging.
    pub subscriber_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Memory,
            address: "127.0.0.1:7480".to_string(),
            relay_bind: None,
            backpressure: Backpressure::Queue,
            queue_capacity: 1024,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5000,
            subscriber_buffer: 1024,
        }
    }
}

/// Dynamic scaling clock configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Enable the scaling clock.
    pub enabled: bool,

    /// Tick interval in seconds; defaults to the heartbeat interval.
    pub interval_secs: Option<u64>,

    /// Consecutive breached (or idle) intervals before recommending.
    pub consecutive_intervals: u32,

    /// Load ratio (players / soft capacity) at or above which a family is breached.
    pub scale_up_ratio: f64,

    /// Load ratio at or below which a family is considered idle.
    pub scale_down_ratio: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
            consecutive_intervals: 3,
            scale_up_ratio: 1.0,
            scale_down_ratio: 0.25,
        }
    }
}

/// Message cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached messages.
    pub capacity: usize,

    /// Packets older (or further in the future) than this are blocked.
    pub replay_window_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            replay_window_secs: 300,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "pretty" or "compact".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Server selection algorithm for a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    WeightedRoundRobin,
    LeastConnection,
    MostConnection,
}

/// Load balancer settings of one family.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Default weight for servers that do not declare one.
    pub weight: u32,

    /// Member count at which admission flags the family for scale-up.
    pub soft_cap: usize,

    /// Member count at which admission is refused.
    pub hard_cap: usize,

    pub algorithm: Algorithm,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            weight: 1,
            soft_cap: 16,
            hard_cap: 32,
            algorithm: Algorithm::WeightedRoundRobin,
        }
    }
}

/// Whitelist attached to a root family.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WhitelistConfig {
    /// Player uuids allowed in.
    pub players: Vec<uuid::Uuid>,

    /// Usernames allowed in (case-insensitive).
    pub usernames: Vec<String>,

    /// Permission that also grants access.
    pub permission: Option<String>,

    /// Flip the final result (turns the list into a blacklist).
    pub inverted: bool,
}

/// Family definition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FamilyConfig {
    /// Unique family id.
    pub id: String,

    /// Parent family id; root families have none.
    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    /// Re-route players whose server goes away (root families only).
    #[serde(default)]
    pub catch_disconnecting_players: bool,

    #[serde(default)]
    pub whitelist: Option<WhitelistConfig>,
}

impl FamilyConfig {
    /// A root family with default load balancing.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            display_name: None,
            load_balancer: LoadBalancerConfig::default(),
            catch_disconnecting_players: false,
            whitelist: None,
        }
    }

    pub fn with_caps(mut self, soft_cap: usize, hard_cap: usize) -> Self {
        self.load_balancer.soft_cap = soft_cap;
        self.load_balancer.hard_cap = hard_cap;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}
