//! Most connection strategy: fill the busiest server before opening another.
//!
//! Candidates are already below their player hard cap, so the busiest one
//! still has room.

use std::sync::Arc;

use crate::config::schema::Algorithm;
use crate::family::server::ServerRecord;
use crate::load_balancer::LoadBalancer;

#[derive(Debug, Default)]
pub struct MostConnection;

impl MostConnection {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for MostConnection {
    fn next_server(&self, candidates: &[Arc<ServerRecord>]) -> Option<Arc<ServerRecord>> {
        candidates
            .iter()
            .min_by(|a, b| {
                b.player_count()
                    .cmp(&a.player_count())
                    .then_with(|| a.server_id.cmp(&b.server_id))
            })
            .cloned()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::MostConnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server;

    #[test]
    fn test_most_conn() {
        let lb = MostConnection::new();
        let quiet = server(1, 1, 2);
        let busy = server(2, 1, 7);
        assert_eq!(lb.next_server(&[quiet.clone(), busy.clone()]).unwrap().server_id, busy.server_id);

        quiet.set_player_count(7);
        assert_eq!(lb.next_server(&[busy, quiet.clone()]).unwrap().server_id, quiet.server_id);
    }
}
