//! Ranked matchmaking collaborator.
//!
//! Ranks come from the host through [`PlayerRank`]; this module only orders
//! waiting players by that number and hands out the tightest group. How a
//! rank is computed is not its concern.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

pub trait PlayerRank: Send + Sync {
    fn rank(&self) -> f64;

    /// Name of the ranking schema; players are only matched within one schema.
    fn schema_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedPlayer {
    pub uuid: Uuid,
    pub rank: f64,
}

/// Waiting players per schema, kept sorted by rank.
#[derive(Debug, Default)]
pub struct Matchmaker {
    queues: Mutex<HashMap<String, Vec<RankedPlayer>>>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `uuid` with the rank reported by `rank`. Re-queueing replaces.
    pub fn enqueue(&self, uuid: Uuid, rank: &dyn PlayerRank) {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        for queue in queues.values_mut() {
            queue.retain(|p| p.uuid != uuid);
        }
        let queue = queues.entry(rank.schema_name().to_string()).or_default();
        insert_sorted(
            queue,
            RankedPlayer {
                uuid,
                rank: rank.rank(),
            },
        );
    }

    /// Put players taken by [`Matchmaker::next_group`] back in line.
    pub fn requeue(&self, schema: &str, players: Vec<RankedPlayer>) {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let queue = queues.entry(schema.to_string()).or_default();
        for player in players {
            insert_sorted(queue, player);
        }
    }

    pub fn remove(&self, uuid: Uuid) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut removed = false;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|p| p.uuid != uuid);
            removed |= queue.len() != before;
        }
        removed
    }

    pub fn waiting(&self, schema: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.get(schema).map_or(0, Vec::len)
    }

    /// Take `size` players whose ranks span the smallest range.
    ///
    /// Returns `None` while fewer than `size` players wait in `schema`.
    pub fn next_group(&self, schema: &str, size: usize) -> Option<Vec<RankedPlayer>> {
        if size == 0 {
            return None;
        }
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let queue = queues.get_mut(schema)?;
        if queue.len() < size {
            return None;
        }
        let start = (0..=queue.len() - size)
            .min_by(|&a, &b| {
                let spread_a = queue[a + size - 1].rank - queue[a].rank;
                let spread_b = queue[b + size - 1].rank - queue[b].rank;
                spread_a.total_cmp(&spread_b)
            })
            .unwrap_or(0);
        Some(queue.drain(start..start + size).collect())
    }
}

fn insert_sorted(queue: &mut Vec<RankedPlayer>, player: RankedPlayer) {
    let at = queue.partition_point(|p| p.rank <= player.rank);
    queue.insert(at, player);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Elo(f64);

    impl PlayerRank for Elo {
        fn rank(&self) -> f64 {
            self.0
        }

        fn schema_name(&self) -> &str {
            "elo"
        }
    }

    #[test]
    fn test_tightest_group() {
        let matchmaker = Matchmaker::new();
        let ids: Vec<Uuid> = (1..=4).map(Uuid::from_u128).collect();
        matchmaker.enqueue(ids[0], &Elo(1000.0));
        matchmaker.enqueue(ids[1], &Elo(1500.0));
        matchmaker.enqueue(ids[2], &Elo(1510.0));
        matchmaker.enqueue(ids[3], &Elo(2200.0));

        let group = matchmaker.next_group("elo", 2).unwrap();
        let uuids: Vec<Uuid> = group.iter().map(|p| p.uuid).collect();
        assert_eq!(uuids, vec![ids[1], ids[2]]);
        assert_eq!(matchmaker.waiting("elo"), 2);
        assert!(matchmaker.next_group("elo", 3).is_none());
    }

    #[test]
    fn test_requeue_replaces() {
        let matchmaker = Matchmaker::new();
        let id = Uuid::new_v4();
        matchmaker.enqueue(id, &Elo(1.0));
        matchmaker.enqueue(id, &Elo(2.0));
        assert_eq!(matchmaker.waiting("elo"), 1);
        assert!(matchmaker.remove(id));
        assert!(!matchmaker.remove(id));
    }

    #[test]
    fn test_requeue_restores_order() {
        let matchmaker = Matchmaker::new();
        let ids: Vec<Uuid> = (1..=3).map(Uuid::from_u128).collect();
        matchmaker.enqueue(ids[0], &Elo(10.0));
        matchmaker.enqueue(ids[1], &Elo(20.0));
        matchmaker.enqueue(ids[2], &Elo(30.0));

        let group = matchmaker.next_group("elo", 2).unwrap();
        matchmaker.requeue("elo", group);
        let all: Vec<Uuid> = matchmaker
            .next_group("elo", 3)
            .unwrap()
            .into_iter()
            .map(|p| p.uuid)
            .collect();
        assert_eq!(all, ids);
    }
}
