//! Loader side of the magic link.
//!
//! # Responsibilities
//! - Register with the proxy and track the session state it answers with
//! - Heartbeat with the live player count while registered
//! - Lock and unlock this server, ask the proxy to move players
//! - Deregister on `stop()`
//!
//! # Data Flow
//! ```text
//! start() → listener + REGISTER_SERVER → PendingVerification
//!     REGISTRATION_ACCEPTED → Registered → HEARTBEAT every interval
//!     REGISTRATION_REJECTED → Rejected (no retry)
//!     STALE_PING            → Unregistered → REGISTER_SERVER again
//! stop()  → DEREGISTER → Deregistered
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::MessageCache;
use crate::config::schema::LinkConfig;
use crate::error::LinkError;
use crate::events::EventBus;
use crate::family::ServerRegistration;
use crate::lifecycle::Shutdown;
use crate::link::channel::{PacketChannel, Role};
use crate::link::session::SessionState;
use crate::packet::{KeyRing, LinkKey, Packet, PacketIdentification, PacketRegistry};
use crate::transport::MessageBus;

/// What a loader tells the proxy about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSettings {
    pub family: String,
    pub address: String,
    pub weight: Option<u32>,
    /// Member caps the loader expects its family to enforce.
    pub soft_cap: Option<usize>,
    pub hard_cap: Option<usize>,
    pub player_soft_cap: Option<usize>,
    pub player_hard_cap: Option<usize>,
}

impl LoaderSettings {
    pub fn new(family: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            address: address.into(),
            weight: None,
            soft_cap: None,
            hard_cap: None,
            player_soft_cap: None,
            player_hard_cap: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_caps(mut self, soft: usize, hard: usize) -> Self {
        self.soft_cap = Some(soft);
        self.hard_cap = Some(hard);
        self
    }

    pub fn with_player_caps(mut self, soft: usize, hard: usize) -> Self {
        self.player_soft_cap = Some(soft);
        self.player_hard_cap = Some(hard);
        self
    }

    fn registration(&self, server_id: Uuid) -> ServerRegistration {
        ServerRegistration {
            server_id,
            family: self.family.clone(),
            address: self.address.clone(),
            weight: self.weight,
            declared_soft_cap: self.soft_cap,
            declared_hard_cap: self.hard_cap,
            player_soft_cap: self.player_soft_cap,
            player_hard_cap: self.player_hard_cap,
        }
    }
}

pub struct LoaderLink {
    settings: LoaderSettings,
    channel: Arc<PacketChannel>,
    state: watch::Sender<SessionState>,
    players: AtomicUsize,
    locked: AtomicBool,
    heartbeat_interval: Duration,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

macro_rules! on_packet {
    ($registry:expr, $link:expr, $identification:expr, $method:ident) => {{
        let link: Weak<LoaderLink> = Weak::clone(&$link);
        $registry.register($identification, move |packet: Packet| {
            let link = link.upgrade();
            async move {
                match link {
                    Some(link) => link.$method(packet).await,
                    None => Ok(()),
                }
            }
        })
    }};
}

impl LoaderLink {
    /// Build a loader link. `trusted` must contain the proxy's key.
    pub fn new(
        id: Uuid,
        settings: LoaderSettings,
        bus: Arc<dyn MessageBus>,
        key: LinkKey,
        trusted: KeyRing,
        config: &LinkConfig,
    ) -> Result<Arc<Self>, LinkError> {
        let registry = Arc::new(PacketRegistry::new());
        let channel = Arc::new(PacketChannel::new(
            id,
            Role::Loader,
            bus,
            Arc::new(key),
            Arc::clone(&registry),
            Arc::new(trusted),
            Arc::new(MessageCache::new(&config.cache, cache_node(id))),
            EventBus::default(),
        ));
        let (state, _) = watch::channel(SessionState::Unregistered);

        let link = Arc::new(Self {
            settings,
            channel,
            state,
            players: AtomicUsize::new(0),
            locked: AtomicBool::new(false),
            heartbeat_interval: Duration::from_secs(config.link.heartbeat_interval_secs.max(1)),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&link);
        on_packet!(registry, weak, PacketIdentification::REGISTRATION_ACCEPTED, on_accepted)?;
        on_packet!(registry, weak, PacketIdentification::REGISTRATION_REJECTED, on_rejected)?;
        on_packet!(registry, weak, PacketIdentification::STALE_PING, on_stale_ping)?;
        on_packet!(registry, weak, PacketIdentification::LOCK_SERVER, on_lock)?;
        on_packet!(registry, weak, PacketIdentification::UNLOCK_SERVER, on_unlock)?;
        Ok(link)
    }

    pub fn id(&self) -> Uuid {
        self.channel.node_id()
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn player_count(&self) -> usize {
        self.players.load(Ordering::Relaxed)
    }

    /// Reported with the next heartbeat.
    pub fn set_player_count(&self, count: usize) {
        self.players.store(count, Ordering::Relaxed);
    }

    /// Registry for application-defined packets.
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        self.channel.registry()
    }

    pub fn channel(&self) -> &Arc<PacketChannel> {
        &self.channel
    }

    /// Start listening, register, and keep heartbeating. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = self.channel.listen(self.shutdown.subscribe());
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::downgrade(self),
            self.shutdown.subscribe(),
            self.heartbeat_interval,
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, heartbeat]);

        tracing::info!(loader_id = %self.id(), family = %self.settings.family, "Loader link started");
        self.register().await
    }

    /// Deregister and stop every task. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state() == SessionState::Registered {
            let deregister = self
                .channel
                .send(self.channel.builder().identification(PacketIdentification::DEREGISTER))
                .await;
            if let Err(e) = deregister {
                tracing::warn!(loader_id = %self.id(), error = %e, "Failed to send deregistration");
            }
        }
        self.state.send_replace(SessionState::Deregistered);
        self.shutdown.trigger();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(loader_id = %self.id(), "Loader link stopped");
    }

    /// Exclude this server from selection.
    pub async fn lock(&self) -> Result<(), LinkError> {
        self.locked.store(true, Ordering::SeqCst);
        self.channel
            .send(self.channel.builder().identification(PacketIdentification::LOCK_SERVER))
            .await
            .map(|_| ())
    }

    pub async fn unlock(&self) -> Result<(), LinkError> {
        self.locked.store(false, Ordering::SeqCst);
        self.channel
            .send(self.channel.builder().identification(PacketIdentification::UNLOCK_SERVER))
            .await
            .map(|_| ())
    }

    /// Ask the proxy to move `player` into `family`.
    pub async fn send_player(&self, player: Uuid, family: &str) -> Result<(), LinkError> {
        self.channel
            .send(
                self.channel
                    .builder()
                    .identification(PacketIdentification::SEND_PLAYER)
                    .payload("player", player.to_string())
                    .payload("family", family),
            )
            .await
            .map(|_| ())
    }

    async fn register(&self) -> Result<(), LinkError> {
        let mut packet = self.channel.builder().identification(PacketIdentification::REGISTER_SERVER);
        for (key, value) in self.settings.registration(self.id()).to_payload().iter() {
            packet = packet.payload(key.clone(), value.clone());
        }

        self.state.send_replace(SessionState::PendingVerification);
        if let Err(e) = self.channel.send(packet).await {
            self.state.send_replace(SessionState::Unregistered);
            return Err(e);
        }
        tracing::debug!(loader_id = %self.id(), family = %self.settings.family, "Registration sent");
        Ok(())
    }

    async fn heartbeat_loop(
        link: Weak<Self>,
        mut shutdown: broadcast::Receiver<()>,
        interval: Duration,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut pending_ticks = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            let Some(link) = link.upgrade() else { break };

            let state = link.state();
            pending_ticks = if state == SessionState::PendingVerification {
                pending_ticks + 1
            } else {
                0
            };
            let result = match state {
                SessionState::Registered => link.heartbeat().await,
                SessionState::Unregistered | SessionState::TimedOut => link.register().await,
                // No answer for two intervals: the request or its reply was lost.
                SessionState::PendingVerification if pending_ticks >= 2 => {
                    pending_ticks = 0;
                    link.register().await
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(loader_id = %link.id(), state = %state, error = %e, "Heartbeat cycle failed");
            }
        }
    }

    async fn heartbeat(&self) -> Result<(), LinkError> {
        self.channel
            .send(
                self.channel
                    .builder()
                    .identification(PacketIdentification::HEARTBEAT)
                    .payload("playerCount", self.player_count()),
            )
            .await
            .map(|_| ())
    }

    async fn on_accepted(&self, packet: Packet) -> Result<(), LinkError> {
        let family = packet.payload().get_str("family").unwrap_or_default().to_string();
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Deregistered {
                return false;
            }
            let changed = *state != SessionState::Registered;
            *state = SessionState::Registered;
            changed
        });
        if changed {
            tracing::info!(loader_id = %self.id(), family = %family, "Registration accepted");
        }
        Ok(())
    }

    async fn on_rejected(&self, packet: Packet) -> Result<(), LinkError> {
        let reason = packet.payload().get_str("reason").unwrap_or("UNKNOWN").to_string();
        tracing::warn!(loader_id = %self.id(), reason = %reason, "Registration rejected");
        self.state.send_if_modified(|state| {
            if *state == SessionState::Deregistered {
                return false;
            }
            *state = SessionState::Rejected;
            true
        });
        Ok(())
    }

    async fn on_stale_ping(&self, _packet: Packet) -> Result<(), LinkError> {
        match self.state() {
            SessionState::Registered | SessionState::TimedOut => {
                tracing::info!(loader_id = %self.id(), "Proxy lost our session, registering again");
                self.register().await
            }
            _ => Ok(()),
        }
    }

    async fn on_lock(&self, _packet: Packet) -> Result<(), LinkError> {
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_unlock(&self, _packet: Packet) -> Result<(), LinkError> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LoaderLink {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for LoaderLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderLink")
            .field("id", &self.id())
            .field("family", &self.settings.family)
            .field("state", &self.state())
            .finish()
    }
}

/// Snowflake node bits derived from the loader id.
fn cache_node(id: Uuid) -> u16 {
    (id.as_u128() & 0x3ff) as u16
}
