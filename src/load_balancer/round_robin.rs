//! Smooth weighted round-robin.
//!
//! Every pick adds each candidate's weight to its running score, takes the
//! highest score and subtracts the total weight from the winner. Over any
//! window of `total_weight` picks each server is chosen exactly `weight`
//! times, interleaved rather than in bursts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::config::schema::Algorithm;
use crate::family::server::ServerRecord;
use crate::load_balancer::{tie_break, LoadBalancer};

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    scores: Mutex<HashMap<Uuid, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, candidates: &[Arc<ServerRecord>]) -> Option<Arc<ServerRecord>> {
        if candidates.is_empty() {
            return None;
        }

        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        // Servers that left or got locked start from zero when they return.
        scores.retain(|id, _| candidates.iter().any(|c| c.server_id == *id));

        let total: i64 = candidates.iter().map(|c| i64::from(c.weight)).sum();
        let mut best: Option<(&Arc<ServerRecord>, i64)> = None;
        for candidate in candidates {
            let score = scores.entry(candidate.server_id).or_insert(0);
            *score += i64::from(candidate.weight);
            let score = *score;
            best = match best {
                None => Some((candidate, score)),
                Some((current, current_score)) => {
                    let wins = score > current_score
                        || (score == current_score && tie_break(candidate, current).is_lt());
                    if wins {
                        Some((candidate, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        let (chosen, _) = best?;
        if let Some(score) = scores.get_mut(&chosen.server_id) {
            *score -= total;
        }
        Some(Arc::clone(chosen))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::WeightedRoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server;

    #[test]
    fn test_weighted_ratio() {
        let lb = WeightedRoundRobin::new();
        let a = server(1, 1, 0);
        let b = server(2, 3, 0);
        let candidates = vec![a.clone(), b.clone()];

        let picks: Vec<Uuid> = (0..4000)
            .map(|_| lb.next_server(&candidates).unwrap().server_id)
            .collect();
        let a_share = picks.iter().filter(|id| **id == a.server_id).count() as f64 / 4000.0;
        assert!((a_share - 0.25).abs() < 0.01, "share of A was {}", a_share);
    }

    #[test]
    fn test_equal_weights_alternate_by_tie_break() {
        let lb = WeightedRoundRobin::new();
        let busy = server(1, 1, 10);
        let idle = server(2, 1, 0);
        let candidates = vec![busy.clone(), idle.clone()];

        // Same score on the first pick; the emptier server wins.
        assert_eq!(lb.next_server(&candidates).unwrap().server_id, idle.server_id);
        assert_eq!(lb.next_server(&candidates).unwrap().server_id, busy.server_id);
        assert_eq!(lb.next_server(&candidates).unwrap().server_id, idle.server_id);
    }

    #[test]
    fn test_tie_on_players_uses_lowest_id() {
        let lb = WeightedRoundRobin::new();
        let low = server(1, 1, 0);
        let high = server(2, 1, 0);
        assert_eq!(lb.next_server(&[high, low.clone()]).unwrap().server_id, low.server_id);
    }

    #[test]
    fn test_empty() {
        assert!(WeightedRoundRobin::new().next_server(&[]).is_none());
    }
}
