//! Proxy-side handlers for the built-in loader packets.
//!
//! # Data Flow
//! ```text
//! REGISTER_SERVER → sessions.begin → FamilyService::register_server
//!                     → REGISTRATION_ACCEPTED | REGISTRATION_REJECTED
//! HEARTBEAT       → sessions.heartbeat → record.touch / player count
//!                     (no session: STALE_PING)
//! LOCK_SERVER     → FamilyService::lock_server   (sender's own server)
//! UNLOCK_SERVER   → FamilyService::unlock_server
//! DEREGISTER      → sessions.deregister → unregister_server → rebalance
//! SEND_PLAYER     → FamilyService::connect_with_fallback
//! ```

use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::error::{AdmissionError, LinkError, PacketError, TransportError, VerificationError};
use crate::events::{EventBus, LeaveReason, ProxyEvent};
use crate::family::{FamilyService, LockTransition, ServerRegistration};
use crate::link::channel::PacketChannel;
use crate::link::session::SessionState;
use crate::link::sessions::{Begin, SessionRegistry};
use crate::packet::{Packet, PacketIdentification, PacketRegistry};
use crate::scaling::DynamicScalingClock;

pub struct ProxyHandlers {
    families: Arc<FamilyService>,
    sessions: Arc<SessionRegistry>,
    channel: Weak<PacketChannel>,
    clock: Arc<DynamicScalingClock>,
    events: EventBus,
}

macro_rules! route {
    ($registry:expr, $this:expr, $identification:expr, $method:ident) => {{
        let this = Arc::clone(&$this);
        $registry.register($identification, move |packet: Packet| {
            let this = Arc::clone(&this);
            async move { this.$method(packet).await }
        })
    }};
}

impl ProxyHandlers {
    pub fn new(
        families: Arc<FamilyService>,
        sessions: Arc<SessionRegistry>,
        channel: Weak<PacketChannel>,
        clock: Arc<DynamicScalingClock>,
        events: EventBus,
    ) -> Self {
        Self {
            families,
            sessions,
            channel,
            clock,
            events,
        }
    }

    /// Register every proxy-side handler with `registry`.
    pub fn install(self: Arc<Self>, registry: &PacketRegistry) -> Result<(), PacketError> {
        route!(registry, self, PacketIdentification::REGISTER_SERVER, on_register)?;
        route!(registry, self, PacketIdentification::HEARTBEAT, on_heartbeat)?;
        route!(registry, self, PacketIdentification::LOCK_SERVER, on_lock)?;
        route!(registry, self, PacketIdentification::UNLOCK_SERVER, on_unlock)?;
        route!(registry, self, PacketIdentification::DEREGISTER, on_deregister)?;
        route!(registry, self, PacketIdentification::SEND_PLAYER, on_send_player)?;
        Ok(())
    }

    fn channel(&self) -> Result<Arc<PacketChannel>, LinkError> {
        self.channel
            .upgrade()
            .ok_or(LinkError::Transport(TransportError::Closed))
    }

    async fn on_register(&self, packet: Packet) -> Result<(), LinkError> {
        let loader_id = packet.sender();
        let key = *packet.signer().ok_or(VerificationError::MissingSignature)?;

        if self.sessions.begin(loader_id, key) == Begin::InFlight {
            tracing::debug!(loader_id = %loader_id, "Registration already in flight, ignoring duplicate");
            return Ok(());
        }

        let admitted = ServerRegistration::from_payload(loader_id, packet.payload())
            .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))
            .and_then(|registration| self.families.register_server(&registration));

        let channel = self.channel()?;
        match admitted {
            Ok(admission) => {
                let family = admission.record.family.clone();
                self.sessions.complete(loader_id, &family);
                tracing::info!(
                    loader_id = %loader_id,
                    family = %family,
                    address = %admission.record.address,
                    members = admission.member_count,
                    readmitted = admission.readmitted,
                    "Loader registered"
                );
                channel
                    .send(
                        channel
                            .builder()
                            .identification(PacketIdentification::REGISTRATION_ACCEPTED)
                            .reply_to(&packet)
                            .payload("family", family.as_str())
                            .payload("serverId", loader_id.to_string()),
                    )
                    .await?;
                self.clock.request_evaluation(&family);
            }
            Err(reason) => {
                self.sessions.reject(loader_id);
                tracing::warn!(loader_id = %loader_id, reason = %reason, "Loader registration rejected");
                self.events.emit(ProxyEvent::RegistrationRejected {
                    loader_id,
                    reason: reason.clone(),
                });
                channel
                    .send(
                        channel
                            .builder()
                            .identification(PacketIdentification::REGISTRATION_REJECTED)
                            .reply_to(&packet)
                            .payload("reason", reason.code())
                            .payload("message", reason.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_heartbeat(&self, packet: Packet) -> Result<(), LinkError> {
        let loader_id = packet.sender();
        let player_count = packet.payload().optional_count("playerCount")?;

        if self.sessions.heartbeat(loader_id) {
            self.families.heartbeat(loader_id, player_count);
            return Ok(());
        }
        if self.sessions.state(loader_id) == SessionState::PendingVerification {
            return Ok(());
        }

        tracing::debug!(loader_id = %loader_id, "Heartbeat from unregistered loader, asking it to re-register");
        let channel = self.channel()?;
        channel
            .send(
                channel
                    .builder()
                    .identification(PacketIdentification::STALE_PING)
                    .reply_to(&packet),
            )
            .await?;
        Ok(())
    }

    async fn on_lock(&self, packet: Packet) -> Result<(), LinkError> {
        let server_id = packet.sender();
        match self.families.lock_server(server_id) {
            Some(LockTransition::Changed) => tracing::info!(server_id = %server_id, "Server locked"),
            Some(LockTransition::Unchanged) => tracing::debug!(server_id = %server_id, "Server already locked"),
            None => tracing::debug!(server_id = %server_id, "Lock request from unknown server"),
        }
        Ok(())
    }

    async fn on_unlock(&self, packet: Packet) -> Result<(), LinkError> {
        let server_id = packet.sender();
        match self.families.unlock_server(server_id) {
            Some(LockTransition::Changed) => tracing::info!(server_id = %server_id, "Server unlocked"),
            Some(LockTransition::Unchanged) => tracing::debug!(server_id = %server_id, "Server already unlocked"),
            None => tracing::debug!(server_id = %server_id, "Unlock request from unknown server"),
        }
        Ok(())
    }

    async fn on_deregister(&self, packet: Packet) -> Result<(), LinkError> {
        let loader_id = packet.sender();
        let session = self.sessions.deregister(loader_id);
        let record = self
            .families
            .unregister_server(loader_id, LeaveReason::Deregistered);

        let family = record
            .map(|r| r.family.clone())
            .or_else(|| session.and_then(|s| s.family));
        tracing::info!(loader_id = %loader_id, family = ?family, "Loader deregistered");
        if let Some(family) = family {
            self.clock.request_evaluation(&family);
        }
        Ok(())
    }

    async fn on_send_player(&self, packet: Packet) -> Result<(), LinkError> {
        let payload = packet.payload();
        let player = Uuid::parse_str(payload.require_str("player")?).map_err(|_| PacketError::FieldType {
            field: "player",
            expected: "uuid",
        })?;
        let family = payload.require_str("family")?;

        let assignment = self.families.connect_with_fallback(player, family)?;
        tracing::info!(
            player = %player,
            requested_by = %packet.sender(),
            family = %assignment.family,
            server_id = %assignment.server_id,
            "Player sent to family"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ProxyHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandlers").finish_non_exhaustive()
    }
}
