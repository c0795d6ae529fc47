//! A single family: membership, lock state and selection.
//!
//! # Responsibilities
//! - Admit servers under the family's soft and hard caps
//! - Evict servers, lock and unlock them
//! - Pick a routing target from unlocked members
//!
//! # Design Decisions
//! - Membership and lock state live together in one immutable snapshot
//!   (`ArcSwap<Vec<Member>>`); selection loads it once and never observes a
//!   half-applied change
//! - Mutations serialize on a per-family writer lock, build a new snapshot
//!   and publish it with a single store
//! - No I/O happens while the writer lock is held
//! - Lock/unlock are last-write-wins and idempotent

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use uuid::Uuid;

use crate::config::schema::{FamilyConfig, LoadBalancerConfig};
use crate::error::{AdmissionError, RoutingError};
use crate::family::server::{
    LockState, ServerRecord, ServerRegistration, DEFAULT_PLAYER_HARD_CAP, DEFAULT_PLAYER_SOFT_CAP,
};
use crate::family::matchmaking::Matchmaker;
use crate::family::whitelist::Whitelist;
use crate::load_balancer::{self, LoadBalancer};
use crate::observability::metrics;

/// A server as seen by one snapshot.
#[derive(Debug, Clone)]
pub struct Member {
    pub record: Arc<ServerRecord>,
    pub lock: LockState,
}

impl Member {
    pub fn is_selectable(&self) -> bool {
        self.lock == LockState::Unlocked && !self.record.is_full()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTransition {
    Changed,
    /// Already in the requested state; nothing was written.
    Unchanged,
}

/// Result of a successful admission.
#[derive(Debug, Clone)]
pub struct Admission {
    pub record: Arc<ServerRecord>,
    pub member_count: usize,
    /// Admitted at or past the soft cap.
    pub soft_cap_breached: bool,
    /// The server was already a member and its record was replaced.
    pub readmitted: bool,
}

pub struct Family {
    config: ArcSwap<FamilyConfig>,
    whitelist: Option<Arc<dyn Whitelist>>,
    members: ArcSwap<Vec<Member>>,
    writer: Mutex<()>,
    balancer: ArcSwap<Box<dyn LoadBalancer>>,
    matchmaker: Matchmaker,
}

impl Family {
    pub fn new(config: FamilyConfig, whitelist: Option<Arc<dyn Whitelist>>) -> Self {
        let balancer = load_balancer::for_algorithm(config.load_balancer.algorithm);
        Self {
            config: ArcSwap::from_pointee(config),
            whitelist,
            members: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            balancer: ArcSwap::from_pointee(balancer),
            matchmaker: Matchmaker::new(),
        }
    }

    pub fn id(&self) -> String {
        self.config.load().id.clone()
    }

    pub fn config(&self) -> Arc<FamilyConfig> {
        self.config.load_full()
    }

    pub fn parent(&self) -> Option<String> {
        self.config.load().parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.config.load().parent.is_none()
    }

    pub fn display_name(&self) -> String {
        let config = self.config.load();
        config.display_name.clone().unwrap_or_else(|| config.id.clone())
    }

    pub fn catch_disconnecting_players(&self) -> bool {
        self.config.load().catch_disconnecting_players
    }

    pub fn load_balancer(&self) -> LoadBalancerConfig {
        self.config.load().load_balancer.clone()
    }

    pub fn whitelist(&self) -> Option<&Arc<dyn Whitelist>> {
        self.whitelist.as_ref()
    }

    /// Players waiting for a ranked match in this family.
    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    /// Current membership and lock state, consistent as of one instant.
    pub fn snapshot(&self) -> Arc<Vec<Member>> {
        self.members.load_full()
    }

    pub fn member_count(&self) -> usize {
        self.members.load().len()
    }

    pub fn contains(&self, server_id: Uuid) -> bool {
        self.members.load().iter().any(|m| m.record.server_id == server_id)
    }

    pub fn member(&self, server_id: Uuid) -> Option<Member> {
        self.members
            .load()
            .iter()
            .find(|m| m.record.server_id == server_id)
            .cloned()
    }

    pub fn lock_state(&self, server_id: Uuid) -> Option<LockState> {
        self.member(server_id).map(|m| m.lock)
    }

    /// Admit a registering server.
    ///
    /// Rejected with `HardCapExceeded` once the family holds `hard_cap`
    /// members. Admission at or past `soft_cap` succeeds but is flagged. A
    /// server that is already a member gets a fresh, unlocked record in
    /// place instead of a second entry.
    pub fn admit(&self, registration: &ServerRegistration) -> Result<Admission, AdmissionError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let config = self.config.load();
        let lb = &config.load_balancer;

        let current = self.members.load();
        let existing = current
            .iter()
            .position(|m| m.record.server_id == registration.server_id);
        let others = current.len() - usize::from(existing.is_some());

        if existing.is_none() && others >= lb.hard_cap {
            tracing::warn!(
                family = %config.id,
                server_id = %registration.server_id,
                members = others,
                hard_cap = lb.hard_cap,
                "Admission rejected: hard cap reached"
            );
            return Err(AdmissionError::HardCapExceeded {
                family: config.id.clone(),
                hard_cap: lb.hard_cap,
            });
        }

        if registration.declared_hard_cap.is_some_and(|cap| cap != lb.hard_cap)
            || registration.declared_soft_cap.is_some_and(|cap| cap != lb.soft_cap)
        {
            tracing::debug!(
                family = %config.id,
                server_id = %registration.server_id,
                "Declared caps differ from family configuration; using family caps"
            );
        }

        let player_soft_cap = registration.player_soft_cap.unwrap_or(DEFAULT_PLAYER_SOFT_CAP);
        let player_hard_cap = registration.player_hard_cap.unwrap_or(DEFAULT_PLAYER_HARD_CAP);
        let record = Arc::new(ServerRecord::new(
            registration,
            registration.weight.unwrap_or(lb.weight),
            player_soft_cap,
            player_hard_cap,
        ));
        let member = Member {
            record: Arc::clone(&record),
            lock: LockState::Unlocked,
        };

        let mut next: Vec<Member> = current.as_ref().clone();
        match existing {
            Some(index) => next[index] = member,
            None => next.push(member),
        }
        let member_count = next.len();
        self.publish(next);

        let soft_cap_breached = others >= lb.soft_cap;
        tracing::info!(
            family = %config.id,
            server_id = %record.server_id,
            address = %record.address,
            members = member_count,
            soft_cap_breached,
            "Server admitted"
        );
        Ok(Admission {
            record,
            member_count,
            soft_cap_breached,
            readmitted: existing.is_some(),
        })
    }

    /// Remove a server. Returns its record if it was a member.
    pub fn evict(&self, server_id: Uuid) -> Option<Arc<ServerRecord>> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.members.load();
        let index = current.iter().position(|m| m.record.server_id == server_id)?;

        let mut next: Vec<Member> = current.as_ref().clone();
        let removed = next.remove(index);
        let remaining = next.len();
        self.publish(next);

        tracing::info!(family = %self.config.load().id, server_id = %server_id, members = remaining, "Server evicted");
        Some(removed.record)
    }

    /// Set the lock state of a member. `None` if the server is not a member.
    pub fn set_lock(&self, server_id: Uuid, lock: LockState) -> Option<LockTransition> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.members.load();
        let index = current.iter().position(|m| m.record.server_id == server_id)?;
        if current[index].lock == lock {
            return Some(LockTransition::Unchanged);
        }

        let mut next: Vec<Member> = current.as_ref().clone();
        next[index].lock = lock;
        self.publish(next);

        tracing::info!(family = %self.config.load().id, server_id = %server_id, state = %lock, "Server lock state changed");
        Some(LockTransition::Changed)
    }

    pub fn lock(&self, server_id: Uuid) -> Option<LockTransition> {
        self.set_lock(server_id, LockState::Locked)
    }

    pub fn unlock(&self, server_id: Uuid) -> Option<LockTransition> {
        self.set_lock(server_id, LockState::Unlocked)
    }

    /// Pick a routing target among unlocked members with room.
    pub fn select(&self) -> Result<Arc<ServerRecord>, RoutingError> {
        let snapshot = self.members.load();
        let candidates: Vec<Arc<ServerRecord>> = snapshot
            .iter()
            .filter(|m| m.is_selectable())
            .map(|m| Arc::clone(&m.record))
            .collect();

        let id = self.id();
        match self.balancer.load().next_server(&candidates) {
            Some(record) => {
                metrics::record_selection(&id, "selected");
                Ok(record)
            }
            None => {
                metrics::record_selection(&id, "no_available_server");
                tracing::debug!(family = %id, members = snapshot.len(), "No available server");
                Err(RoutingError::NoAvailableServer(id))
            }
        }
    }

    /// Apply reloaded settings. Membership is untouched.
    pub fn apply(&self, config: FamilyConfig) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.config.load();
        if previous.load_balancer.algorithm != config.load_balancer.algorithm {
            self.balancer
                .store(Arc::new(load_balancer::for_algorithm(config.load_balancer.algorithm)));
        }
        if previous.load_balancer != config.load_balancer {
            tracing::info!(
                family = %config.id,
                soft_cap = config.load_balancer.soft_cap,
                hard_cap = config.load_balancer.hard_cap,
                algorithm = ?config.load_balancer.algorithm,
                "Family load balancer updated"
            );
        }
        self.config.store(Arc::new(config));
    }

    fn publish(&self, next: Vec<Member>) {
        let locked = next.iter().filter(|m| m.lock == LockState::Locked).count();
        metrics::record_family_members(&self.config.load().id, next.len(), locked);
        self.members.store(Arc::new(next));
    }
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config.load();
        f.debug_struct("Family")
            .field("id", &config.id)
            .field("parent", &config.parent)
            .field("members", &self.members.load().len())
            .field("algorithm", &config.load_balancer.algorithm)
            .finish()
    }
}
