//! Signed packet channel over a message bus.
//!
//! # Responsibilities
//! - Sign, encode and publish outgoing packets exactly once
//! - Decode incoming text, drop what is not addressed to this node
//! - Verify, replay-check and dispatch packets to the registry
//! - Surface transport state changes as events
//!
//! # Data Flow
//! ```text
//! bus.subscribe() → listener task
//!     → codec::decode            (malformed: logged, dropped)
//!     → target filter / own echo (dropped quietly)
//!     → cache.record (Pending)
//!     → per-sender lane          (ordered per publisher, concurrent across)
//!         → KeyResolver + verify (Blocked on failure)
//!         → cache.admit          (Blocked on replay / staleness)
//!         → registry.dispatch    (Sent, Failed, or Blocked when unhandled)
//! ```
//!
//! # Design Decisions
//! - Nothing that happens to one message can end the subscription
//! - A lane is removed only while its queue is empty and under the map's
//!   write lock, so no packet can be handed to a lane that is going away

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{MessageCache, MessageStatus};
use crate::error::{LinkError, PacketError, VerificationError};
use crate::events::{EventBus, ProxyEvent};
use crate::observability::metrics;
use crate::packet::{codec, Dispatch, KeyRing, LinkKey, Packet, PacketBuilder, PacketRegistry, PacketState};
use crate::transport::MessageBus;

const LANE_IDLE: Duration = Duration::from_secs(30);

/// Which side of the link this channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Proxy,
    Loader,
}

/// Chooses the key a received packet must verify against.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, packet: &Packet) -> Result<VerifyingKey, VerificationError>;
}

impl KeyResolver for KeyRing {
    fn resolve(&self, packet: &Packet) -> Result<VerifyingKey, VerificationError> {
        let signer = packet.signer().ok_or(VerificationError::MissingSignature)?;
        if self.is_trusted(signer) {
            Ok(*signer)
        } else {
            Err(VerificationError::UnknownSigner)
        }
    }
}

type Lane = mpsc::UnboundedSender<(Packet, u64)>;

pub struct PacketChannel {
    node_id: Uuid,
    role: Role,
    bus: Arc<dyn MessageBus>,
    key: Arc<LinkKey>,
    registry: Arc<PacketRegistry>,
    resolver: Arc<dyn KeyResolver>,
    cache: Arc<MessageCache>,
    events: EventBus,
    lanes: DashMap<Uuid, Lane>,
}

impl PacketChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: Uuid,
        role: Role,
        bus: Arc<dyn MessageBus>,
        key: Arc<LinkKey>,
        registry: Arc<PacketRegistry>,
        resolver: Arc<dyn KeyResolver>,
        cache: Arc<MessageCache>,
        events: EventBus,
    ) -> Self {
        Self {
            node_id,
            role,
            bus,
            key,
            registry,
            resolver,
            cache,
            events,
            lanes: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// A builder with this node as sender.
    pub fn builder(&self) -> PacketBuilder {
        Packet::builder(self.node_id)
    }

    /// Sign (if needed), encode and publish `packet`.
    ///
    /// A packet is published at most once: `Sent` and `Received` packets are
    /// refused before anything touches the bus. If the bus refuses the
    /// message the packet stays `Signed` and may be published again.
    pub async fn publish(&self, packet: &mut Packet) -> Result<(), LinkError> {
        match packet.state() {
            PacketState::Sendable | PacketState::Signed => {}
            other => return Err(PacketError::NotSendable(other).into()),
        }
        packet.sign(&self.key)?;
        let text = codec::encode(packet)?;
        self.bus.publish(text).await?;
        packet.mark_sent()?;

        metrics::record_packet_published(packet.identification().as_str());
        tracing::debug!(
            identification = %packet.identification(),
            packet_id = %packet.id(),
            target = ?packet.target(),
            "Packet published"
        );
        Ok(())
    }

    /// Build and publish in one step.
    pub async fn send(&self, builder: PacketBuilder) -> Result<Packet, LinkError> {
        let mut packet = builder.build()?;
        self.publish(&mut packet).await?;
        Ok(packet)
    }

    /// Subscribe now and process inbound messages until shutdown.
    pub fn listen(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut inbound = self.bus.subscribe();
        let mut state = self.bus.connection_state();
        let channel = Arc::clone(self);

        tokio::spawn(async move {
            tracing::info!(channel = %channel.bus.channel(), node_id = %channel.node_id, role = ?channel.role, "Packet listener started");
            let mut watching_state = true;
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Ok(text) => channel.accept(text),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Packet listener lagged, messages lost");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = state.changed(), if watching_state => match changed {
                        Ok(()) => {
                            let current = *state.borrow_and_update();
                            tracing::info!(state = %current, "Transport state changed");
                            metrics::record_transport_state(current.as_str());
                            channel.events.emit(ProxyEvent::TransportStateChanged(current));
                        }
                        Err(_) => watching_state = false,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            tracing::info!(node_id = %channel.node_id, "Packet listener stopped");
        })
    }

    fn accepts(&self, packet: &Packet) -> bool {
        if packet.sender() == self.node_id {
            return false;
        }
        match self.role {
            Role::Proxy => packet.target().addresses_proxy(),
            Role::Loader => packet.target().addresses_loader(self.node_id),
        }
    }

    fn accept(self: &Arc<Self>, text: String) {
        let packet = match codec::decode(&text) {
            Ok(packet) => packet,
            Err(e) => {
                metrics::record_packet_received("unknown", "malformed");
                tracing::warn!(error = %e, "Dropped malformed packet");
                return;
            }
        };
        if !self.accepts(&packet) {
            return;
        }
        let snowflake = self.cache.record(packet.id(), text, packet.sent_at());
        self.route(packet, snowflake);
    }

    fn route(self: &Arc<Self>, packet: Packet, snowflake: u64) {
        let sender = packet.sender();
        let item = match self.lanes.get(&sender) {
            Some(lane) => match lane.send((packet, snowflake)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => (packet, snowflake),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(item);
        self.lanes.insert(sender, tx.clone());
        tokio::spawn(Arc::clone(self).run_lane(sender, tx, rx));
    }

    async fn run_lane(
        self: Arc<Self>,
        sender: Uuid,
        own: Lane,
        mut rx: mpsc::UnboundedReceiver<(Packet, u64)>,
    ) {
        loop {
            match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some((packet, snowflake))) => self.process(packet, snowflake).await,
                Ok(None) => break,
                Err(_) => {
                    let removed = self
                        .lanes
                        .remove_if(&sender, |_, lane| lane.same_channel(&own) && rx.is_empty());
                    let still_ours = self
                        .lanes
                        .get(&sender)
                        .is_some_and(|lane| lane.same_channel(&own));
                    if removed.is_some() || !still_ours {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, packet: Packet, snowflake: u64) {
        let identification = packet.identification().as_str().to_string();

        let verified = self
            .resolver
            .resolve(&packet)
            .and_then(|key| packet.verify(&key))
            .and_then(|()| self.cache.admit(packet.id(), packet.sent_at()));
        if let Err(e) = verified {
            let outcome = match e {
                VerificationError::Replayed(_) | VerificationError::Stale => "replayed",
                _ => "unverified",
            };
            metrics::record_packet_received(&identification, outcome);
            tracing::warn!(
                identification = %identification,
                sender = %packet.sender(),
                packet_id = %packet.id(),
                error = %e,
                "Dropped packet that failed verification"
            );
            self.cache
                .set_status(snowflake, MessageStatus::Blocked, Some(e.to_string()));
            return;
        }

        let sender = packet.sender();
        match self.registry.dispatch(packet).await {
            Dispatch::Handled(Ok(())) => {
                metrics::record_packet_received(&identification, "handled");
                self.cache.set_status(snowflake, MessageStatus::Sent, None);
            }
            Dispatch::Handled(Err(e)) => {
                metrics::record_packet_received(&identification, "failed");
                tracing::warn!(identification = %identification, sender = %sender, error = %e, "Packet handler failed");
                self.cache
                    .set_status(snowflake, MessageStatus::Failed, Some(e.to_string()));
            }
            Dispatch::Unhandled => {
                metrics::record_packet_received(&identification, "unhandled");
                tracing::debug!(identification = %identification, sender = %sender, "No handler for packet, dropped");
                self.cache
                    .set_status(snowflake, MessageStatus::Blocked, Some("no handler".to_string()));
            }
        }
    }
}

impl std::fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketChannel")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("channel", &self.bus.channel())
            .field("lanes", &self.lanes.len())
            .finish()
    }
}
