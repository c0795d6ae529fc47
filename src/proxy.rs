//! The proxy node: everything the proxy side of the magic link owns.
//!
//! # Responsibilities
//! - Wire the family tree, session registry, scaling clock and packet
//!   channel together from one `LinkConfig`
//! - Explicit `start()` / `stop()`; both are idempotent
//! - Player routing and server lock/unlock for the embedding proxy
//!
//! # Data Flow
//! ```text
//! bus ──▶ PacketChannel ──▶ ProxyHandlers ──▶ FamilyService / SessionRegistry
//!                                                   │
//! LivenessSweeper (every sweep interval) ───────────┤
//! DynamicScalingClock (every scaling interval) ─────┘──▶ EventBus
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::MessageCache;
use crate::config::schema::LinkConfig;
use crate::error::{LinkError, RoutingError};
use crate::events::{EventBus, ProxyEvent};
use crate::family::{FamilyService, LockTransition};
use crate::lifecycle::Shutdown;
use crate::link::{
    resolve_link_key, LivenessSweeper, PacketChannel, ProxyHandlers, Role, SessionKeys, SessionRegistry,
};
use crate::packet::{KeyRing, LinkKey, PacketIdentification, PacketRegistry, Target};
use crate::player::{PlayerRegistry, ServerAssignment};
use crate::scaling::{DynamicScalingClock, ScalingPolicy};
use crate::transport::MessageBus;

pub struct Proxy {
    verifying_key: VerifyingKey,
    scaling_enabled: bool,
    sweep_interval: Duration,
    players: Arc<PlayerRegistry>,
    families: Arc<FamilyService>,
    sessions: Arc<SessionRegistry>,
    clock: Arc<DynamicScalingClock>,
    channel: Arc<PacketChannel>,
    events: EventBus,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Proxy {
    /// Build a proxy, taking its signing key from the environment or config.
    pub fn new(config: &LinkConfig, bus: Arc<dyn MessageBus>) -> Result<Self, LinkError> {
        let key = resolve_link_key(&config.link)?;
        Self::with_key(config, bus, key)
    }

    pub fn with_key(config: &LinkConfig, bus: Arc<dyn MessageBus>, key: LinkKey) -> Result<Self, LinkError> {
        let mut trusted = KeyRing::from_encoded(&config.link.trusted_keys)?;
        trusted.trust(key.verifying_key());
        let verifying_key = key.verifying_key();

        let events = EventBus::default();
        let players = Arc::new(PlayerRegistry::new());
        let families = Arc::new(FamilyService::from_config(
            &config.families,
            Arc::clone(&players),
            events.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
            config.link.liveness_timeout_secs,
        )));
        let interval = config
            .scaling
            .interval_secs
            .unwrap_or(config.link.heartbeat_interval_secs);
        let clock = Arc::new(DynamicScalingClock::new(
            Arc::clone(&families),
            ScalingPolicy::from(&config.scaling),
            Duration::from_secs(interval.max(1)),
            events.clone(),
        ));

        let registry = Arc::new(PacketRegistry::new());
        let channel = Arc::new(PacketChannel::new(
            Uuid::new_v4(),
            Role::Proxy,
            bus,
            Arc::new(key),
            Arc::clone(&registry),
            Arc::new(SessionKeys::new(Arc::clone(&sessions), trusted)),
            Arc::new(MessageCache::new(&config.cache, 0)),
            events.clone(),
        ));
        Arc::new(ProxyHandlers::new(
            Arc::clone(&families),
            Arc::clone(&sessions),
            Arc::downgrade(&channel),
            Arc::clone(&clock),
            events.clone(),
        ))
        .install(&registry)?;

        Ok(Self {
            verifying_key,
            scaling_enabled: config.scaling.enabled,
            sweep_interval: Duration::from_millis(config.link.sweep_interval_ms),
            players,
            families,
            sessions,
            clock,
            channel,
            events,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the listener, the liveness sweeper and (if enabled) the scaling
    /// clock. Must be called inside a Tokio runtime. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = Vec::with_capacity(3);
        tasks.push(self.channel.listen(self.shutdown.subscribe()));

        let sweeper = LivenessSweeper::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.families),
            Arc::clone(&self.clock),
            self.events.clone(),
            self.sweep_interval,
        );
        tasks.push(tokio::spawn(sweeper.run(self.shutdown.subscribe())));

        if self.scaling_enabled {
            tasks.push(tokio::spawn(Arc::clone(&self.clock).run(self.shutdown.subscribe())));
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        tracing::info!(
            node_id = %self.id(),
            families = self.families.families().len(),
            scaling = self.scaling_enabled,
            "Proxy started"
        );
    }

    /// Stop every background task and wait for them. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
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
        tracing::info!(node_id = %self.id(), "Proxy stopped");
    }

    pub fn id(&self) -> Uuid {
        self.channel.node_id()
    }

    /// Public half of the proxy's signing key; loaders must trust it.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub fn families(&self) -> &Arc<FamilyService> {
        &self.families
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    pub fn clock(&self) -> &Arc<DynamicScalingClock> {
        &self.clock
    }

    pub fn channel(&self) -> &Arc<PacketChannel> {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// A player joined the proxy; route them to `family` (or the first
    /// configured family), falling back to parents when it is full.
    pub fn connect_player(
        &self,
        uuid: Uuid,
        username: &str,
        family: Option<&str>,
    ) -> Result<ServerAssignment, RoutingError> {
        if !self.players.is_online(uuid) {
            self.players.join(uuid, username);
        }
        let family = match family {
            Some(id) => id.to_string(),
            None => self
                .families
                .default_family()
                .map(|f| f.id())
                .ok_or_else(|| RoutingError::UnknownFamily("<default>".to_string()))?,
        };
        self.families.connect_with_fallback(uuid, &family)
    }

    pub fn disconnect_player(&self, uuid: Uuid) {
        if let Some(player) = self.families.disconnect_player(uuid) {
            tracing::debug!(player = %player.uuid, username = %player.username, "Player left");
        }
    }

    /// Lock a server here and tell its loader.
    pub async fn lock_server(&self, server_id: Uuid) -> Result<LockTransition, LinkError> {
        let transition = self
            .families
            .lock_server(server_id)
            .ok_or(RoutingError::UnknownServer(server_id))?;
        self.notify_loader(server_id, PacketIdentification::LOCK_SERVER).await?;
        Ok(transition)
    }

    pub async fn unlock_server(&self, server_id: Uuid) -> Result<LockTransition, LinkError> {
        let transition = self
            .families
            .unlock_server(server_id)
            .ok_or(RoutingError::UnknownServer(server_id))?;
        self.notify_loader(server_id, PacketIdentification::UNLOCK_SERVER).await?;
        Ok(transition)
    }

    async fn notify_loader(&self, server_id: Uuid, identification: PacketIdentification) -> Result<(), LinkError> {
        self.channel
            .send(
                self.channel
                    .builder()
                    .identification(identification)
                    .target(Target::Loader(server_id)),
            )
            .await
            .map(|_| ())
    }

    /// Apply a reloaded configuration's family section.
    pub fn apply_config(&self, config: &LinkConfig) {
        self.families.apply_config(&config.families);
        tracing::info!(families = config.families.len(), "Family configuration reloaded");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id())
            .field("families", &self.families)
            .field("sessions", &self.sessions.active())
            .finish()
    }
}
