//! Server records: one per admitted loader.
//!
//! # Responsibilities
//! - Describe a loader's declared registration (address, weight, player caps)
//! - Track live load (player count) and liveness (last seen)
//!
//! Lock state is not stored here: it lives in the owning family's member
//! snapshot so a lock toggle and a membership change are observed together.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use uuid::Uuid;

use crate::error::PacketError;
use crate::packet::{now_millis, Payload};

/// Player caps for loaders that do not declare their own.
pub const DEFAULT_PLAYER_SOFT_CAP: usize = 20;
pub const DEFAULT_PLAYER_HARD_CAP: usize = 30;

/// Routing eligibility of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Unlocked,
    Locked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => f.write_str("unlocked"),
            LockState::Locked => f.write_str("locked"),
        }
    }
}

/// What a loader declares when it asks to join a family.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRegistration {
    pub server_id: Uuid,
    pub family: String,
    pub address: String,
    /// `None` falls back to the family's configured weight.
    pub weight: Option<u32>,
    /// Member caps the loader expects its family to run with.
    pub declared_soft_cap: Option<usize>,
    pub declared_hard_cap: Option<usize>,
    pub player_soft_cap: Option<usize>,
    pub player_hard_cap: Option<usize>,
}

impl ServerRegistration {
    pub fn new(server_id: Uuid, family: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            server_id,
            family: family.into(),
            address: address.into(),
            weight: None,
            declared_soft_cap: None,
            declared_hard_cap: None,
            player_soft_cap: None,
            player_hard_cap: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_player_caps(mut self, soft: usize, hard: usize) -> Self {
        self.player_soft_cap = Some(soft);
        self.player_hard_cap = Some(hard);
        self
    }

    /// Read a `REGISTER_SERVER` payload sent by `server_id`.
    ///
    /// `family` and `address` are required; everything else is optional and
    /// unknown fields are ignored.
    pub fn from_payload(server_id: Uuid, payload: &Payload) -> Result<Self, PacketError> {
        let weight = match payload.optional_count("weight")? {
            Some(w) => Some(u32::try_from(w).map_err(|_| PacketError::FieldType {
                field: "weight",
                expected: "32-bit count",
            })?),
            None => None,
        };
        Ok(Self {
            server_id,
            family: payload.require_str("family")?.to_string(),
            address: payload.require_str("address")?.to_string(),
            weight,
            declared_soft_cap: payload.optional_count("softCap")?,
            declared_hard_cap: payload.optional_count("hardCap")?,
            player_soft_cap: payload.optional_count("playerSoftCap")?,
            player_hard_cap: payload.optional_count("playerHardCap")?,
        })
    }

    /// The inverse of [`ServerRegistration::from_payload`].
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("family", self.family.as_str());
        payload.insert("address", self.address.as_str());
        if let Some(weight) = self.weight {
            payload.insert("weight", weight);
        }
        if let Some(cap) = self.declared_soft_cap {
            payload.insert("softCap", cap);
        }
        if let Some(cap) = self.declared_hard_cap {
            payload.insert("hardCap", cap);
        }
        if let Some(cap) = self.player_soft_cap {
            payload.insert("playerSoftCap", cap);
        }
        if let Some(cap) = self.player_hard_cap {
            payload.insert("playerHardCap", cap);
        }
        payload
    }
}

/// An admitted server.
#[derive(Debug)]
pub struct ServerRecord {
    pub server_id: Uuid,
    pub family: String,
    pub address: String,
    pub weight: u32,
    pub player_soft_cap: usize,
    pub player_hard_cap: usize,
    player_count: AtomicUsize,
    last_seen_at: AtomicU64,
}

impl ServerRecord {
    pub fn new(
        registration: &ServerRegistration,
        weight: u32,
        player_soft_cap: usize,
        player_hard_cap: usize,
    ) -> Self {
        Self {
            server_id: registration.server_id,
            family: registration.family.clone(),
            address: registration.address.clone(),
            weight: weight.max(1),
            player_soft_cap,
            player_hard_cap: player_hard_cap.max(player_soft_cap),
            player_count: AtomicUsize::new(0),
            last_seen_at: AtomicU64::new(now_millis()),
        }
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    /// Overwrite the count with the loader's own report.
    pub fn set_player_count(&self, count: usize) {
        self.player_count.store(count, Ordering::Relaxed);
    }

    pub fn inc_players(&self) {
        self.player_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_players(&self) {
        let _ = self
            .player_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// At the player hard cap; not selectable.
    pub fn is_full(&self) -> bool {
        self.player_count() >= self.player_hard_cap
    }

    pub fn is_soft_full(&self) -> bool {
        self.player_count() >= self.player_soft_cap
    }

    /// Unix millis of the last packet seen from this server.
    pub fn last_seen_at(&self) -> u64 {
        self.last_seen_at.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_seen_at.store(now_millis(), Ordering::Relaxed);
    }
}
