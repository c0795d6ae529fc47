//! Events emitted to external listeners.
//!
//! Provisioning collaborators, admin tooling and tests subscribe to the
//! [`EventBus`]. Emission never blocks and never fails; a bus without
//! subscribers simply drops events.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AdmissionError;
use crate::player::ServerAssignment;
use crate::scaling::Recommendation;
use crate::transport::ConnectionState;

/// Why a server left its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Deregistered,
    TimedOut,
    /// Moved to another family by a new registration.
    Moved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceEvent {
    pub family: String,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    Rebalance(RebalanceEvent),
    ServerRegistered {
        family: String,
        server_id: Uuid,
    },
    ServerUnregistered {
        family: String,
        server_id: Uuid,
        reason: LeaveReason,
    },
    RegistrationRejected {
        loader_id: Uuid,
        reason: AdmissionError,
    },
    SoftCapBreached {
        family: String,
        members: usize,
    },
    ServerLocked {
        family: String,
        server_id: Uuid,
    },
    ServerUnlocked {
        family: String,
        server_id: Uuid,
    },
    Connected {
        player: Uuid,
        assignment: ServerAssignment,
    },
    /// A player's server went away underneath them.
    LoaderLeave {
        server_id: Uuid,
        player: Uuid,
    },
    SessionTimedOut {
        loader_id: Uuid,
    },
    TransportStateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProxyEvent) {
        tracing::trace!(event = ?event, "Event emitted");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(ProxyEvent::SessionTimedOut { loader_id: Uuid::nil() });

        let mut rx = bus.subscribe();
        bus.emit(ProxyEvent::TransportStateChanged(ConnectionState::Reconnecting));
        assert_eq!(
            rx.recv().await.unwrap(),
            ProxyEvent::TransportStateChanged(ConnectionState::Reconnecting)
        );
    }
}
