//! The periodic scale evaluation loop.
//!
//! # Responsibilities
//! - Tick every interval and evaluate each family
//! - Keep evaluations of one family from overlapping (single-flight)
//! - Accept out-of-band evaluation requests (server timed out or left)
//! - Stop cleanly: an evaluation in progress finishes, no new tick starts

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};

use crate::events::{EventBus, ProxyEvent, RebalanceEvent};
use crate::family::{Family, FamilyService};
use crate::observability::metrics;
use crate::scaling::{FamilyLoad, Pressure, Recommendation, ScalingPolicy};

/// Outcome of evaluating one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Evaluated(Recommendation),
    /// Another evaluation of this family was still running.
    Skipped,
    UnknownFamily,
}

pub struct DynamicScalingClock {
    families: Arc<FamilyService>,
    policy: ScalingPolicy,
    interval: Duration,
    events: EventBus,
    flights: DashMap<String, Arc<Mutex<Pressure>>>,
}

impl DynamicScalingClock {
    pub fn new(families: Arc<FamilyService>, policy: ScalingPolicy, interval: Duration, events: EventBus) -> Self {
        Self {
            families,
            policy,
            interval,
            events,
            flights: DashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Scaling clock starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Scaling clock received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Evaluate every family once, concurrently.
    pub async fn tick(&self) -> Vec<(String, Evaluation)> {
        let families = self.families.families();
        let evaluations = families.iter().map(|family| async move {
            let id = family.id();
            let evaluation = self.evaluate_family(family).await;
            (id, evaluation)
        });
        join_all(evaluations).await
    }

    /// Evaluate one family now, outside the regular tick.
    pub async fn evaluate(&self, family_id: &str) -> Evaluation {
        match self.families.family(family_id) {
            Some(family) => self.evaluate_family(&family).await,
            None => Evaluation::UnknownFamily,
        }
    }

    /// Schedule an evaluation in the background.
    pub fn request_evaluation(self: &Arc<Self>, family_id: &str) {
        let clock = Arc::clone(self);
        let family_id = family_id.to_string();
        tokio::spawn(async move {
            clock.evaluate(&family_id).await;
        });
    }

    async fn evaluate_family(&self, family: &Family) -> Evaluation {
        let id = family.id();
        let flight = Arc::clone(self.flights.entry(id.clone()).or_default().value());
        let Ok(mut pressure) = flight.try_lock() else {
            tracing::debug!(family = %id, "Scale evaluation already in flight, skipping");
            return Evaluation::Skipped;
        };

        let load = measure(family);
        let recommendation = pressure.observe(&load, &self.policy);
        tracing::debug!(
            family = %id,
            members = load.members,
            soft_cap = load.soft_cap,
            players = load.players,
            capacity = load.capacity,
            recommendation = %recommendation,
            "Family evaluated"
        );

        if recommendation != Recommendation::NoAction {
            tracing::info!(family = %id, recommendation = %recommendation, "Rebalance recommended");
            metrics::record_scaling_recommendation(&id, recommendation.as_str());
            self.events.emit(ProxyEvent::Rebalance(RebalanceEvent {
                family: id,
                recommendation,
            }));
        }
        Evaluation::Evaluated(recommendation)
    }
}

fn measure(family: &Family) -> FamilyLoad {
    let snapshot = family.snapshot();
    let unlocked: Vec<_> = snapshot
        .iter()
        .filter(|m| m.lock == crate::family::LockState::Unlocked)
        .collect();
    let caps = family.load_balancer();
    FamilyLoad {
        members: snapshot.len(),
        unlocked: unlocked.len(),
        players: snapshot.iter().map(|m| m.record.player_count()).sum(),
        capacity: unlocked.iter().map(|m| m.record.player_soft_cap).sum(),
        soft_cap: caps.soft_cap,
        hard_cap: caps.hard_cap,
    }
}
