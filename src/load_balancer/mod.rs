//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Player routed to a family
//!     → family snapshot (members + lock state, one atomic load)
//!     → candidates: unlocked members below their player hard cap
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (smooth weighted round robin)
//!         - least_conn.rs (fewest players)
//!         - most_conn.rs (fill the busiest server first)
//!     → Return server record or NoAvailableServer
//! ```
//!
//! # Design Decisions
//! - Algorithms never see locked servers; filtering happens in the family
//! - Ties break on lowest player count, then lowest server id, so selection
//!   is deterministic for a given snapshot and balancer state
//! - Algorithm selection per family, swappable on config reload

pub mod least_conn;
pub mod most_conn;
pub mod round_robin;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::config::schema::Algorithm;
use crate::family::server::ServerRecord;

pub use least_conn::LeastConnection;
pub use most_conn::MostConnection;
pub use round_robin::WeightedRoundRobin;

/// A server selection strategy.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick one of `candidates`. All candidates are eligible.
    fn next_server(&self, candidates: &[Arc<ServerRecord>]) -> Option<Arc<ServerRecord>>;

    fn algorithm(&self) -> Algorithm;
}

/// Build the balancer configured for a family.
pub fn for_algorithm(algorithm: Algorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        Algorithm::LeastConnection => Box::new(LeastConnection::new()),
        Algorithm::MostConnection => Box::new(MostConnection::new()),
    }
}

/// Deterministic ordering between otherwise equal candidates.
pub(crate) fn tie_break(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    a.player_count()
        .cmp(&b.player_count())
        .then_with(|| a.server_id.cmp(&b.server_id))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::family::server::ServerRegistration;
    use uuid::Uuid;

    pub fn server(id: u128, weight: u32, players: usize) -> Arc<ServerRecord> {
        let registration = ServerRegistration::new(Uuid::from_u128(id), "test", format!("10.0.0.{}:25565", id));
        let record = ServerRecord::new(&registration, weight, 50, 100);
        record.set_player_count(players);
        Arc::new(record)
    }
}
