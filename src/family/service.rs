//! The family tree and everything that spans families.
//!
//! # Responsibilities
//! - Own every family, indexed by id, plus a server → family index
//! - Admit, evict, lock and unlock servers by id
//! - Route players: whitelist at the root, selection, parent fallback
//! - Send ranked groups from a family's matchmaker to one server
//! - Re-home players whose server left (catch disconnecting players)
//! - Apply reloaded family configuration
//!
//! # Design Decisions
//! - A server is evicted from its previous family before it is admitted to
//!   a new one, so it never belongs to two families
//! - The server index and family membership change together while the
//!   server's index entry is locked; concurrent admit and evict of one
//!   server serialize there
//! - Events are emitted after the family's writer lock is released

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::schema::FamilyConfig;
use crate::error::{AdmissionError, RoutingError};
use crate::events::{EventBus, LeaveReason, ProxyEvent};
use crate::family::matchmaking::PlayerRank;
use crate::family::node::{Admission, Family, LockTransition};
use crate::family::server::{ServerRecord, ServerRegistration};
use crate::family::whitelist::{ConfiguredWhitelist, PermissionSource, Whitelist};
use crate::player::{Player, PlayerRegistry, ServerAssignment};

pub struct FamilyService {
    families: DashMap<String, Arc<Family>>,
    /// Family ids in configuration order.
    order: ArcSwap<Vec<String>>,
    servers: DashMap<Uuid, String>,
    players: Arc<PlayerRegistry>,
    events: EventBus,
    permissions: Option<Arc<dyn PermissionSource>>,
}

impl FamilyService {
    pub fn new(players: Arc<PlayerRegistry>, events: EventBus) -> Self {
        Self {
            families: DashMap::new(),
            order: ArcSwap::from_pointee(Vec::new()),
            servers: DashMap::new(),
            players,
            events,
            permissions: None,
        }
    }

    /// Permission lookups used by whitelists created from now on.
    pub fn with_permissions(mut self, source: Arc<dyn PermissionSource>) -> Self {
        self.permissions = Some(source);
        self
    }

    pub fn from_config(configs: &[FamilyConfig], players: Arc<PlayerRegistry>, events: EventBus) -> Self {
        let service = Self::new(players, events);
        service.apply_config(configs);
        service
    }

    /// Add new families and update existing ones.
    ///
    /// Families missing from `configs` are kept: their servers are still
    /// connected and will leave through the normal deregistration path.
    pub fn apply_config(&self, configs: &[FamilyConfig]) {
        let mut order = self.order.load().as_ref().clone();
        for config in configs {
            match self.families.get(&config.id) {
                Some(family) => family.apply(config.clone()),
                None => {
                    let whitelist = config.whitelist.as_ref().map(|w| {
                        let mut whitelist = ConfiguredWhitelist::new(w);
                        if let Some(source) = &self.permissions {
                            whitelist = whitelist.with_permissions(Arc::clone(source));
                        }
                        Arc::new(whitelist) as Arc<dyn Whitelist>
                    });
                    tracing::info!(family = %config.id, parent = ?config.parent, "Family registered");
                    self.families
                        .insert(config.id.clone(), Arc::new(Family::new(config.clone(), whitelist)));
                    order.push(config.id.clone());
                }
            }
        }
        for id in order.iter() {
            if !configs.iter().any(|c| &c.id == id) {
                tracing::warn!(family = %id, "Family missing from reloaded config; keeping it");
            }
        }
        self.order.store(Arc::new(order));
    }

    pub fn family(&self, id: &str) -> Option<Arc<Family>> {
        self.families.get(id).map(|f| Arc::clone(f.value()))
    }

    /// All families in configuration order.
    pub fn families(&self) -> Vec<Arc<Family>> {
        self.order.load().iter().filter_map(|id| self.family(id)).collect()
    }

    /// The first root family; where players land when no family is named.
    pub fn default_family(&self) -> Option<Arc<Family>> {
        self.families().into_iter().find(|f| f.is_root())
    }

    /// Walk up the parent chain to the root.
    pub fn root_of(&self, id: &str) -> Option<Arc<Family>> {
        let mut current = self.family(id)?;
        for _ in 0..self.families.len() {
            match current.parent().and_then(|p| self.family(&p)) {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
        Some(current)
    }

    pub fn family_of(&self, server_id: Uuid) -> Option<Arc<Family>> {
        let id = self.servers.get(&server_id).map(|f| f.value().clone())?;
        self.family(&id)
    }

    pub fn record(&self, server_id: Uuid) -> Option<Arc<ServerRecord>> {
        self.family_of(server_id)?.member(server_id).map(|m| m.record)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Admit a registering server into the family it names.
    pub fn register_server(&self, registration: &ServerRegistration) -> Result<Admission, AdmissionError> {
        let family = self
            .family(&registration.family)
            .ok_or_else(|| AdmissionError::UnknownFamily(registration.family.clone()))?;
        let server_id = registration.server_id;

        // The index entry stays locked until membership matches it.
        let (admitted, moved) = match self.servers.entry(server_id) {
            Entry::Occupied(mut entry) => {
                let leaving = *entry.get() != registration.family;
                let moved = if leaving {
                    let previous = entry.get().clone();
                    self.family(&previous)
                        .and_then(|f| f.evict(server_id))
                        .map(|_| previous)
                } else {
                    None
                };
                let admitted = family.admit(registration);
                if admitted.is_ok() {
                    entry.insert(registration.family.clone());
                } else if leaving {
                    entry.remove();
                }
                (admitted, moved)
            }
            Entry::Vacant(entry) => {
                let admitted = family.admit(registration);
                if admitted.is_ok() {
                    entry.insert(registration.family.clone());
                }
                (admitted, None)
            }
        };

        if let Some(previous) = moved {
            self.evicted(server_id, &previous, LeaveReason::Moved);
        }
        let admission = admitted?;

        self.events.emit(ProxyEvent::ServerRegistered {
            family: registration.family.clone(),
            server_id,
        });
        if admission.soft_cap_breached {
            self.events.emit(ProxyEvent::SoftCapBreached {
                family: registration.family.clone(),
                members: admission.member_count,
            });
        }
        Ok(admission)
    }

    /// Evict a server and deal with the players that were on it.
    pub fn unregister_server(&self, server_id: Uuid, reason: LeaveReason) -> Option<Arc<ServerRecord>> {
        self.unregister_if(server_id, reason, || true)
    }

    /// Evict a server only if `condition` still holds once its index entry
    /// is locked. A registration for the same server either completes
    /// before the check or waits until the eviction is done.
    pub fn unregister_if(
        &self,
        server_id: Uuid,
        reason: LeaveReason,
        condition: impl FnOnce() -> bool,
    ) -> Option<Arc<ServerRecord>> {
        let evicted = match self.servers.entry(server_id) {
            Entry::Occupied(entry) => {
                if !condition() {
                    return None;
                }
                let family_id = entry.remove();
                self.family(&family_id)
                    .and_then(|f| f.evict(server_id))
                    .map(|record| (family_id, record))
            }
            Entry::Vacant(_vacant) => {
                if !condition() {
                    return None;
                }
                // Not indexed; make sure no family still lists it.
                self.families()
                    .into_iter()
                    .find_map(|f| f.evict(server_id).map(|record| (f.id(), record)))
            }
        };

        let (family_id, record) = evicted?;
        self.evicted(server_id, &family_id, reason);
        Some(record)
    }

    fn evicted(&self, server_id: Uuid, family_id: &str, reason: LeaveReason) {
        self.events.emit(ProxyEvent::ServerUnregistered {
            family: family_id.to_string(),
            server_id,
            reason,
        });
        self.rehome_players(server_id, family_id);
    }

    fn rehome_players(&self, server_id: Uuid, family_id: &str) {
        let displaced = self.players.players_on(server_id);
        if displaced.is_empty() {
            return;
        }
        let catcher = self
            .root_of(family_id)
            .filter(|root| root.catch_disconnecting_players());

        for player in displaced {
            self.players.unassign(player.uuid, server_id);
            self.events.emit(ProxyEvent::LoaderLeave {
                server_id,
                player: player.uuid,
            });
            if let Some(root) = &catcher {
                match self.connect_with_fallback(player.uuid, &root.id()) {
                    Ok(assignment) => {
                        tracing::info!(player = %player.uuid, server_id = %assignment.server_id, "Caught disconnecting player");
                    }
                    Err(e) => {
                        tracing::warn!(player = %player.uuid, error = %e, "Could not catch disconnecting player");
                    }
                }
            }
        }
    }

    pub fn lock_server(&self, server_id: Uuid) -> Option<LockTransition> {
        let family = self.family_of(server_id)?;
        let transition = family.lock(server_id)?;
        if transition == LockTransition::Changed {
            self.events.emit(ProxyEvent::ServerLocked {
                family: family.id(),
                server_id,
            });
        }
        Some(transition)
    }

    pub fn unlock_server(&self, server_id: Uuid) -> Option<LockTransition> {
        let family = self.family_of(server_id)?;
        let transition = family.unlock(server_id)?;
        if transition == LockTransition::Changed {
            self.events.emit(ProxyEvent::ServerUnlocked {
                family: family.id(),
                server_id,
            });
        }
        Some(transition)
    }

    /// Liveness and load report from a loader. `false` for unknown servers.
    pub fn heartbeat(&self, server_id: Uuid, player_count: Option<usize>) -> bool {
        match self.record(server_id) {
            Some(record) => {
                record.touch();
                if let Some(count) = player_count {
                    record.set_player_count(count);
                }
                true
            }
            None => false,
        }
    }

    /// Route an online player to a server of `family_id`.
    pub fn connect(&self, player: Uuid, family_id: &str) -> Result<ServerAssignment, RoutingError> {
        let family = self.admitted_family(player, family_id)?;
        let assignment = loop {
            let record = family.select()?;
            if let Some(assignment) = self.place(player, &family, &record)? {
                break assignment;
            }
        };
        self.connected(player, &assignment);
        Ok(assignment)
    }

    /// Queue an online player for a ranked match in `family_id`.
    pub fn enqueue_ranked(&self, player: Uuid, family_id: &str, rank: &dyn PlayerRank) -> Result<(), RoutingError> {
        let family = self.admitted_family(player, family_id)?;
        family.matchmaker().enqueue(player, rank);
        tracing::debug!(player = %player, family = %family_id, schema = %rank.schema_name(), "Player queued for ranked match");
        Ok(())
    }

    /// Send the `size` closest-ranked waiting players of `schema` to one
    /// server of `family_id`. `Ok(None)` while too few players wait.
    ///
    /// A player that no longer fits on the chosen server is routed on its
    /// own; players that went offline are skipped.
    pub fn connect_ranked_group(
        &self,
        family_id: &str,
        schema: &str,
        size: usize,
    ) -> Result<Option<Vec<ServerAssignment>>, RoutingError> {
        let family = self
            .family(family_id)
            .ok_or_else(|| RoutingError::UnknownFamily(family_id.to_string()))?;
        let Some(group) = family.matchmaker().next_group(schema, size) else {
            return Ok(None);
        };
        let record = match family.select() {
            Ok(record) => record,
            Err(e) => {
                family.matchmaker().requeue(schema, group);
                return Err(e);
            }
        };

        let mut assignments = Vec::with_capacity(group.len());
        for ranked in group {
            let placed = if record.is_full() {
                Ok(None)
            } else {
                self.place(ranked.uuid, &family, &record)
            };
            let assignment = match placed {
                Ok(Some(assignment)) => {
                    self.connected(ranked.uuid, &assignment);
                    Ok(assignment)
                }
                Ok(None) => self.connect(ranked.uuid, family_id),
                Err(e) => Err(e),
            };
            match assignment {
                Ok(assignment) => assignments.push(assignment),
                Err(e) => {
                    tracing::warn!(player = %ranked.uuid, family = %family_id, error = %e, "Ranked player not placed");
                }
            }
        }
        tracing::info!(family = %family_id, schema = %schema, server_id = %record.server_id, players = assignments.len(), "Ranked group connected");
        Ok(Some(assignments))
    }

    /// An online player and the family it may enter.
    fn admitted_family(&self, player: Uuid, family_id: &str) -> Result<Arc<Family>, RoutingError> {
        let online: Player = self
            .players
            .get(player)
            .ok_or(RoutingError::PlayerOffline(player))?;
        let family = self
            .family(family_id)
            .ok_or_else(|| RoutingError::UnknownFamily(family_id.to_string()))?;

        if let Some(whitelist) = self.root_of(family_id).as_ref().and_then(|r| r.whitelist().cloned()) {
            if !whitelist.validate(&online) {
                return Err(RoutingError::NotWhitelisted(player, family_id.to_string()));
            }
        }
        Ok(family)
    }

    /// Assign `player` to `record`. `None` if the server was evicted between
    /// selection and assignment; its players may already have been re-homed
    /// without this one.
    fn place(
        &self,
        player: Uuid,
        family: &Family,
        record: &Arc<ServerRecord>,
    ) -> Result<Option<ServerAssignment>, RoutingError> {
        let assignment = ServerAssignment {
            server_id: record.server_id,
            family: family.id(),
            address: record.address.clone(),
        };
        let previous = self.players.assign(player, assignment.clone())?;
        record.inc_players();
        if let Some(previous) = previous.and_then(|p| self.record(p.server_id)) {
            previous.dec_players();
        }
        if family.contains(record.server_id) {
            return Ok(Some(assignment));
        }
        self.players.unassign(player, record.server_id);
        tracing::debug!(player = %player, server_id = %record.server_id, "Selected server left; selecting again");
        Ok(None)
    }

    fn connected(&self, player: Uuid, assignment: &ServerAssignment) {
        tracing::debug!(player = %player, family = %assignment.family, server_id = %assignment.server_id, "Player connected");
        self.events.emit(ProxyEvent::Connected {
            player,
            assignment: assignment.clone(),
        });
    }

    /// Like [`FamilyService::connect`], walking up to parent families while
    /// a family has no available server.
    pub fn connect_with_fallback(&self, player: Uuid, family_id: &str) -> Result<ServerAssignment, RoutingError> {
        let mut current = family_id.to_string();
        for _ in 0..=self.families.len() {
            match self.connect(player, &current) {
                Err(RoutingError::NoAvailableServer(_)) => {
                    match self.family(&current).and_then(|f| f.parent()) {
                        Some(parent) => {
                            tracing::debug!(family = %current, parent = %parent, "Falling back to parent family");
                            current = parent;
                        }
                        None => break,
                    }
                }
                other => return other,
            }
        }
        Err(RoutingError::NoAvailableServer(family_id.to_string()))
    }

    /// Forget a player that left the proxy.
    pub fn disconnect_player(&self, player: Uuid) -> Option<Player> {
        for family in self.families() {
            family.matchmaker().remove(player);
        }
        let left = self.players.leave(player)?;
        if let Some(record) = left.assignment.as_ref().and_then(|a| self.record(a.server_id)) {
            record.dec_players();
        }
        Some(left)
    }
}

impl std::fmt::Debug for FamilyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyService")
            .field("families", &self.order.load())
            .field("servers", &self.servers.len())
            .finish()
    }
}
