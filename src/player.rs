//! Process-wide player registry.
//!
//! # Responsibilities
//! - One live record per player uuid, added on connect, removed on disconnect
//! - Track each player's current server assignment
//!
//! # Design Decisions
//! - DashMap keyed by uuid; a second join for the same uuid replaces the
//!   first record instead of creating a duplicate
//! - Reads hand out clones so no shard lock escapes the registry

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::RoutingError;

/// Where a player is currently routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAssignment {
    pub server_id: Uuid,
    pub family: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub uuid: Uuid,
    pub username: String,
    pub assignment: Option<ServerAssignment>,
}

impl Player {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
            assignment: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: DashMap<Uuid, Player>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connecting player. Returns the record it replaced, if any.
    pub fn join(&self, uuid: Uuid, username: impl Into<String>) -> Option<Player> {
        self.players.insert(uuid, Player::new(uuid, username))
    }

    pub fn leave(&self, uuid: Uuid) -> Option<Player> {
        self.players.remove(&uuid).map(|(_, player)| player)
    }

    pub fn get(&self, uuid: Uuid) -> Option<Player> {
        self.players.get(&uuid).map(|p| p.clone())
    }

    pub fn is_online(&self, uuid: Uuid) -> bool {
        self.players.contains_key(&uuid)
    }

    /// Point `uuid` at `assignment`, returning the previous assignment.
    pub fn assign(
        &self,
        uuid: Uuid,
        assignment: ServerAssignment,
    ) -> Result<Option<ServerAssignment>, RoutingError> {
        let mut player = self
            .players
            .get_mut(&uuid)
            .ok_or(RoutingError::PlayerOffline(uuid))?;
        Ok(player.assignment.replace(assignment))
    }

    /// Clear the assignment if it still points at `server_id`.
    pub fn unassign(&self, uuid: Uuid, server_id: Uuid) -> bool {
        match self.players.get_mut(&uuid) {
            Some(mut player) => {
                let on_server = player
                    .assignment
                    .as_ref()
                    .is_some_and(|a| a.server_id == server_id);
                if on_server {
                    player.assignment = None;
                }
                on_server
            }
            None => false,
        }
    }

    /// Players currently assigned to `server_id`.
    pub fn players_on(&self, server_id: Uuid) -> Vec<Player> {
        self.players
            .iter()
            .filter(|p| {
                p.assignment
                    .as_ref()
                    .is_some_and(|a| a.server_id == server_id)
            })
            .map(|p| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(server: u128) -> ServerAssignment {
        ServerAssignment {
            server_id: Uuid::from_u128(server),
            family: "lobby".into(),
            address: "10.0.0.1:25565".into(),
        }
    }

    #[test]
    fn test_single_record_per_uuid() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        assert!(registry.join(uuid, "Notch").is_none());
        let replaced = registry.join(uuid, "Notch").unwrap();
        assert_eq!(replaced.username, "Notch");
        assert_eq!(registry.len(), 1);
        assert!(registry.leave(uuid).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_assignment_tracking() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        assert_eq!(
            registry.assign(uuid, assignment(1)),
            Err(RoutingError::PlayerOffline(uuid))
        );

        registry.join(uuid, "jeb_");
        assert_eq!(registry.assign(uuid, assignment(1)).unwrap(), None);
        assert_eq!(registry.players_on(Uuid::from_u128(1)).len(), 1);

        assert!(!registry.unassign(uuid, Uuid::from_u128(2)));
        assert!(registry.unassign(uuid, Uuid::from_u128(1)));
        assert!(registry.get(uuid).unwrap().assignment.is_none());
    }
}
