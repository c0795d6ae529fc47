//! Per-loader session state.

use std::fmt;

use ed25519_dalek::VerifyingKey;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Registration state machine of one loader.
///
/// ```text
/// Unregistered → PendingVerification → Registered → Deregistered
///                        │                  └──────→ TimedOut
///                        └─→ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unregistered,
    PendingVerification,
    Registered,
    Deregistered,
    TimedOut,
    Rejected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unregistered => "unregistered",
            SessionState::PendingVerification => "pending_verification",
            SessionState::Registered => "registered",
            SessionState::Deregistered => "deregistered",
            SessionState::TimedOut => "timed_out",
            SessionState::Rejected => "rejected",
        }
    }

    /// The session is over; only a fresh registration starts a new one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Deregistered | SessionState::TimedOut | SessionState::Rejected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The proxy's record of a connected loader.
#[derive(Debug, Clone)]
pub struct MagicLinkSession {
    pub loader_id: Uuid,
    /// Key the loader registered with; later packets must match it.
    pub key: VerifyingKey,
    pub state: SessionState,
    pub family: Option<String>,
    pub last_heartbeat: Instant,
}

impl MagicLinkSession {
    pub fn pending(loader_id: Uuid, key: VerifyingKey) -> Self {
        Self {
            loader_id,
            key,
            state: SessionState::PendingVerification,
            family: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Registered and silent for longer than `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::Registered
            && now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}
