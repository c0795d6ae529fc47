//! Session registry and liveness sweeper.
//!
//! # Responsibilities
//! - Own one `MagicLinkSession` per loader (proxy side)
//! - Collapse concurrent registrations of one loader into a single attempt
//! - Pin each loader's registration key for later verification
//! - Time out silent loaders and clean up after them
//!
//! # Design Decisions
//! - Ended sessions are removed; their final state is kept separately so
//!   callers can still ask how a loader's last session ended
//! - Expiry is re-checked under the entry lock, so a heartbeat that lands
//!   during a sweep wins
//! - A timed-out server is only evicted if its loader has not started a new
//!   session meanwhile; the check runs under the family index lock
//! - How a session ended is remembered for `ENDED_RETENTION`, then pruned
//!   by the sweeper

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::VerificationError;
use crate::events::{EventBus, LeaveReason, ProxyEvent};
use crate::family::FamilyService;
use crate::link::channel::KeyResolver;
use crate::link::session::{MagicLinkSession, SessionState};
use crate::observability::metrics;
use crate::packet::{KeyRing, Packet};
use crate::scaling::DynamicScalingClock;

/// Result of asking to start a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started,
    /// A registration for this loader is already being admitted.
    InFlight,
}

/// How long the final state of an ended session stays queryable.
pub const ENDED_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, MagicLinkSession>,
    ended: DashMap<Uuid, (SessionState, Instant)>,
    liveness_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ended: DashMap::new(),
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Move a loader into `PendingVerification`, unless it already is.
    pub fn begin(&self, loader_id: Uuid, key: VerifyingKey) -> Begin {
        let begin = match self.sessions.entry(loader_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().state == SessionState::PendingVerification {
                    Begin::InFlight
                } else {
                    let session = entry.get_mut();
                    session.state = SessionState::PendingVerification;
                    session.key = key;
                    Begin::Started
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(MagicLinkSession::pending(loader_id, key));
                Begin::Started
            }
        };
        if begin == Begin::Started {
            self.ended.remove(&loader_id);
        }
        begin
    }

    /// Admission succeeded.
    pub fn complete(&self, loader_id: Uuid, family: &str) -> bool {
        let completed = match self.sessions.get_mut(&loader_id) {
            Some(mut session) if session.state == SessionState::PendingVerification => {
                session.state = SessionState::Registered;
                session.family = Some(family.to_string());
                session.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        };
        self.record_active();
        completed
    }

    /// Admission failed; the loader must register again on its own.
    pub fn reject(&self, loader_id: Uuid) {
        self.end(loader_id, SessionState::Rejected);
    }

    /// Refresh liveness. `false` if the loader has no registered session.
    pub fn heartbeat(&self, loader_id: Uuid) -> bool {
        match self.sessions.get_mut(&loader_id) {
            Some(mut session) if session.state == SessionState::Registered => {
                session.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn deregister(&self, loader_id: Uuid) -> Option<MagicLinkSession> {
        self.end(loader_id, SessionState::Deregistered)
    }

    /// Remove every registered session silent for longer than the timeout.
    pub fn expire(&self, now: Instant) -> Vec<MagicLinkSession> {
        let timeout = self.liveness_timeout;
        let candidates: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, timeout))
            .map(|s| s.loader_id)
            .collect();

        let mut expired = Vec::new();
        for loader_id in candidates {
            if let Some((_, mut session)) = self
                .sessions
                .remove_if(&loader_id, |_, s| s.is_expired(now, timeout))
            {
                session.state = SessionState::TimedOut;
                self.ended.insert(loader_id, (SessionState::TimedOut, now));
                expired.push(session);
            }
        }
        if !expired.is_empty() {
            self.record_active();
        }
        expired
    }

    fn end(&self, loader_id: Uuid, state: SessionState) -> Option<MagicLinkSession> {
        let removed = self.sessions.remove(&loader_id).map(|(_, mut session)| {
            session.state = state;
            session
        });
        self.ended.insert(loader_id, (state, Instant::now()));
        self.record_active();
        removed
    }

    /// Forget ended sessions older than [`ENDED_RETENTION`].
    pub fn prune_ended(&self, now: Instant) -> usize {
        let before = self.ended.len();
        self.ended
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= ENDED_RETENTION);
        before - self.ended.len()
    }

    /// The loader has a pending or registered session.
    pub fn is_live(&self, loader_id: Uuid) -> bool {
        self.sessions.contains_key(&loader_id)
    }

    /// Current state, or how the last session ended.
    pub fn state(&self, loader_id: Uuid) -> SessionState {
        if let Some(session) = self.sessions.get(&loader_id) {
            return session.state;
        }
        self.ended
            .get(&loader_id)
            .map(|ended| ended.0)
            .unwrap_or(SessionState::Unregistered)
    }

    pub fn session(&self, loader_id: Uuid) -> Option<MagicLinkSession> {
        self.sessions.get(&loader_id).map(|s| s.clone())
    }

    pub fn pinned_key(&self, loader_id: Uuid) -> Option<VerifyingKey> {
        self.sessions.get(&loader_id).map(|s| s.key)
    }

    /// Number of registered loaders.
    pub fn active(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Registered)
            .count()
    }

    fn record_active(&self) {
        metrics::record_active_sessions(self.active());
    }
}

/// Proxy-side key lookup: pinned session keys first, then the key ring.
pub struct SessionKeys {
    sessions: Arc<SessionRegistry>,
    trusted: KeyRing,
}

impl SessionKeys {
    pub fn new(sessions: Arc<SessionRegistry>, trusted: KeyRing) -> Self {
        Self { sessions, trusted }
    }
}

impl KeyResolver for SessionKeys {
    fn resolve(&self, packet: &Packet) -> Result<VerifyingKey, VerificationError> {
        let signer = packet.signer().ok_or(VerificationError::MissingSignature)?;
        match self.sessions.pinned_key(packet.sender()) {
            Some(pinned) if pinned != *signer => Err(VerificationError::SignerMismatch(packet.sender())),
            Some(pinned) => Ok(pinned),
            None if self.trusted.is_trusted(signer) => Ok(*signer),
            None => Err(VerificationError::UnknownSigner),
        }
    }
}

/// Periodically times out silent loaders.
pub struct LivenessSweeper {
    sessions: Arc<SessionRegistry>,
    families: Arc<FamilyService>,
    clock: Arc<DynamicScalingClock>,
    events: EventBus,
    interval: Duration,
}

impl LivenessSweeper {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        families: Arc<FamilyService>,
        clock: Arc<DynamicScalingClock>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            families,
            clock,
            events,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_secs = self.sessions.liveness_timeout().as_secs(),
            "Liveness sweeper starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Liveness sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Time out expired sessions and evict their servers.
    pub fn sweep(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let expired = self.sessions.expire(now);
        let mut timed_out = Vec::with_capacity(expired.len());
        for session in expired {
            let loader_id = session.loader_id;
            tracing::warn!(loader_id = %loader_id, family = ?session.family, "Loader session timed out");
            let evicted = self
                .families
                .unregister_if(loader_id, LeaveReason::TimedOut, || !self.sessions.is_live(loader_id));
            if evicted.is_none() && self.sessions.is_live(loader_id) {
                tracing::info!(loader_id = %loader_id, "Loader registered again before eviction; keeping its server");
            }
            self.events.emit(ProxyEvent::SessionTimedOut {
                loader_id: session.loader_id,
            });
            if let Some(family) = &session.family {
                self.clock.request_evaluation(family);
            }
            timed_out.push(loader_id);
        }
        let pruned = self.sessions.prune_ended(now);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned ended sessions");
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::LinkKey;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(15))
    }

    #[test]
    fn test_registration_is_single_flight() {
        let sessions = registry();
        let loader = Uuid::new_v4();
        let key = LinkKey::generate().verifying_key();

        assert_eq!(sessions.begin(loader, key), Begin::Started);
        assert_eq!(sessions.begin(loader, key), Begin::InFlight);
        assert_eq!(sessions.state(loader), SessionState::PendingVerification);

        assert!(sessions.complete(loader, "lobby"));
        assert!(!sessions.complete(loader, "lobby"));
        assert_eq!(sessions.state(loader), SessionState::Registered);
        assert_eq!(sessions.active(), 1);

        // A registered loader may register again.
        assert_eq!(sessions.begin(loader, key), Begin::Started);
    }

    #[test]
    fn test_rejection_and_deregistration_end_sessions() {
        let sessions = registry();
        let key = LinkKey::generate().verifying_key();
        let rejected = Uuid::new_v4();
        sessions.begin(rejected, key);
        sessions.reject(rejected);
        assert_eq!(sessions.state(rejected), SessionState::Rejected);
        assert!(sessions.pinned_key(rejected).is_none());

        let leaving = Uuid::new_v4();
        sessions.begin(leaving, key);
        sessions.complete(leaving, "lobby");
        assert!(sessions.deregister(leaving).is_some());
        assert_eq!(sessions.state(leaving), SessionState::Deregistered);
        assert!(!sessions.heartbeat(leaving));
        assert_eq!(sessions.state(Uuid::new_v4()), SessionState::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_respects_heartbeats() {
        let sessions = registry();
        let key = LinkKey::generate().verifying_key();
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        for id in [quiet, chatty] {
            sessions.begin(id, key);
            sessions.complete(id, "lobby");
        }

        for _ in 0..4 {
            time::advance(Duration::from_secs(4)).await;
            assert!(sessions.heartbeat(chatty));
        }
        let expired = sessions.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].loader_id, quiet);
        assert_eq!(sessions.state(quiet), SessionState::TimedOut);
        assert_eq!(sessions.state(chatty), SessionState::Registered);
    }

    #[test]
    fn test_pinned_key_wins_over_ring() {
        let sessions = Arc::new(registry());
        let loader_key = LinkKey::generate();
        let other_key = LinkKey::generate();
        let mut ring = KeyRing::new();
        ring.trust(loader_key.verifying_key());
        ring.trust(other_key.verifying_key());
        let resolver = SessionKeys::new(Arc::clone(&sessions), ring);

        let loader = Uuid::new_v4();
        sessions.begin(loader, loader_key.verifying_key());

        let mut forged = Packet::builder(loader)
            .identification(crate::packet::PacketIdentification::HEARTBEAT)
            .build()
            .unwrap();
        forged.sign(&other_key).unwrap();
        assert_eq!(
            resolver.resolve(&forged),
            Err(VerificationError::SignerMismatch(loader))
        );

        let mut genuine = Packet::builder(loader)
            .identification(crate::packet::PacketIdentification::HEARTBEAT)
            .build()
            .unwrap();
        genuine.sign(&loader_key).unwrap();
        assert_eq!(resolver.resolve(&genuine), Ok(loader_key.verifying_key()));
    }

    fn sweeper(sessions: &Arc<SessionRegistry>) -> (LivenessSweeper, Arc<FamilyService>) {
        use crate::config::schema::FamilyConfig;
        use crate::player::PlayerRegistry;
        use crate::scaling::ScalingPolicy;

        let events = EventBus::default();
        let families = Arc::new(FamilyService::from_config(
            &[FamilyConfig::new("lobby")],
            Arc::new(PlayerRegistry::new()),
            events.clone(),
        ));
        let clock = Arc::new(DynamicScalingClock::new(
            Arc::clone(&families),
            ScalingPolicy::default(),
            Duration::from_secs(5),
            events.clone(),
        ));
        let sweeper = LivenessSweeper::new(
            Arc::clone(sessions),
            Arc::clone(&families),
            clock,
            events,
            Duration::from_millis(500),
        );
        (sweeper, families)
    }

    fn admit(sessions: &SessionRegistry, families: &FamilyService, loader: Uuid, key: VerifyingKey) {
        use crate::family::ServerRegistration;

        assert_eq!(sessions.begin(loader, key), Begin::Started);
        families
            .register_server(&ServerRegistration::new(loader, "lobby", "a:1"))
            .unwrap();
        assert!(sessions.complete(loader, "lobby"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_loader() {
        let sessions = Arc::new(registry());
        let (sweeper, families) = sweeper(&sessions);
        let key = LinkKey::generate().verifying_key();
        let loader = Uuid::new_v4();
        admit(&sessions, &families, loader, key);

        time::advance(Duration::from_secs(16)).await;
        assert_eq!(sweeper.sweep(), vec![loader]);
        assert_eq!(sessions.state(loader), SessionState::TimedOut);
        assert!(families.family_of(loader).is_none());
        assert!(!families.family("lobby").unwrap().contains(loader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistered_loader_keeps_its_server() {
        let sessions = Arc::new(registry());
        let (_, families) = sweeper(&sessions);
        let key = LinkKey::generate().verifying_key();
        let loader = Uuid::new_v4();
        admit(&sessions, &families, loader, key);
        time::advance(Duration::from_secs(16)).await;

        // The session expires, then the loader registers again before the
        // sweeper gets to evict its server.
        assert_eq!(sessions.expire(Instant::now()).len(), 1);
        admit(&sessions, &families, loader, key);
        let evicted = families.unregister_if(loader, LeaveReason::TimedOut, || !sessions.is_live(loader));

        assert!(evicted.is_none());
        assert_eq!(sessions.state(loader), SessionState::Registered);
        assert!(families.family("lobby").unwrap().contains(loader));
        assert!(families.heartbeat(loader, Some(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_sessions_are_pruned() {
        let sessions = Arc::new(registry());
        let (sweeper, _) = sweeper(&sessions);
        let key = LinkKey::generate().verifying_key();
        let loader = Uuid::new_v4();
        sessions.begin(loader, key);
        sessions.reject(loader);

        time::advance(ENDED_RETENTION).await;
        sweeper.sweep();
        assert_eq!(sessions.state(loader), SessionState::Rejected);

        time::advance(Duration::from_secs(1)).await;
        sweeper.sweep();
        assert_eq!(sessions.state(loader), SessionState::Unregistered);
    }
}
