//! Whitelist capability for root families.
//!
//! The family only ever asks `validate(player)`; how the answer is reached
//! is up to the implementation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::schema::WhitelistConfig;
use crate::player::Player;

pub trait Whitelist: Send + Sync + fmt::Debug {
    fn validate(&self, player: &Player) -> bool;
}

/// Permission lookups supplied by the host proxy.
pub trait PermissionSource: Send + Sync {
    fn has_permission(&self, player: &Player, permission: &str) -> bool;
}

/// Whitelist built from the `[families.whitelist]` table.
///
/// A player passes when they match the id filters (if any) and hold the
/// permission (if one is configured). `inverted` flips the final answer.
pub struct ConfiguredWhitelist {
    players: HashSet<Uuid>,
    usernames: HashSet<String>,
    permission: Option<String>,
    inverted: bool,
    permissions: Option<Arc<dyn PermissionSource>>,
}

impl ConfiguredWhitelist {
    pub fn new(config: &WhitelistConfig) -> Self {
        Self {
            players: config.players.iter().copied().collect(),
            usernames: config.usernames.iter().map(|u| u.to_lowercase()).collect(),
            permission: config.permission.clone(),
            inverted: config.inverted,
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, source: Arc<dyn PermissionSource>) -> Self {
        self.permissions = Some(source);
        self
    }

    fn matches_ids(&self, player: &Player) -> bool {
        if self.players.is_empty() && self.usernames.is_empty() {
            return true;
        }
        self.players.contains(&player.uuid)
            || self.usernames.contains(&player.username.to_lowercase())
    }

    fn has_permission(&self, player: &Player) -> bool {
        match (&self.permission, &self.permissions) {
            (None, _) => true,
            (Some(permission), Some(source)) => source.has_permission(player, permission),
            // A required permission nobody can grant.
            (Some(_), None) => false,
        }
    }
}

impl Whitelist for ConfiguredWhitelist {
    fn validate(&self, player: &Player) -> bool {
        let allowed = self.matches_ids(player) && self.has_permission(player);
        allowed != self.inverted
    }
}

impl fmt::Debug for ConfiguredWhitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredWhitelist")
            .field("players", &self.players.len())
            .field("usernames", &self.usernames.len())
            .field("permission", &self.permission)
            .field("inverted", &self.inverted)
            .finish()
    }
}
