//! Least connection strategy.

use std::sync::Arc;

use crate::config::schema::Algorithm;
use crate::family::server::ServerRecord;
use crate::load_balancer::{tie_break, LoadBalancer};

/// Selects the server with the fewest players; ties go to the lowest id.
#[derive(Debug, Default)]
pub struct LeastConnection;

impl LeastConnection {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnection {
    fn next_server(&self, candidates: &[Arc<ServerRecord>]) -> Option<Arc<ServerRecord>> {
        candidates
            .iter()
            .min_by(|a, b| tie_break(a, b))
            .cloned()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeastConnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnection::new();
        let b1 = server(1, 1, 1);
        let b2 = server(2, 1, 0);
        let candidates = vec![b1.clone(), b2.clone()];

        assert_eq!(lb.next_server(&candidates).unwrap().server_id, b2.server_id);

        b2.set_player_count(2);
        assert_eq!(lb.next_server(&candidates).unwrap().server_id, b1.server_id);

        b1.set_player_count(2);
        assert_eq!(lb.next_server(&candidates).unwrap().server_id, b1.server_id);
    }
}
