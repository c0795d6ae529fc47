//! Dynamic scaling recommendations.
//!
//! # Data Flow
//! ```text
//! clock.rs tick (interval = heartbeat unless configured)
//!     → per family, single-flight
//!     → breached = members >= family soft cap, or load ratio >= scale_up_ratio
//!     → load ratio = players / Σ player soft caps of unlocked members
//!     → streak counters (breach / idle)
//!     → RebalanceEvent{family, ScaleUp | ScaleDown} on the event bus
//! ```
//!
//! # Design Decisions
//! - Only computes recommendations; provisioning belongs to whoever listens
//! - NoAction is returned to callers but never emitted as an event
//! - A family at or past its soft cap never scales down, however idle its
//!   servers are

pub mod clock;

use std::fmt;

use crate::config::schema::ScalingConfig;

pub use clock::{DynamicScalingClock, Evaluation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recommendation {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::ScaleUp => "scale_up",
            Recommendation::ScaleDown => "scale_down",
            Recommendation::NoAction => "no_action",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for turning load into a recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Consecutive intervals a condition must hold before it is reported.
    pub consecutive_intervals: u32,
    pub scale_up_ratio: f64,
    pub scale_down_ratio: f64,
}

impl From<&ScalingConfig> for ScalingPolicy {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            consecutive_intervals: config.consecutive_intervals.max(1),
            scale_up_ratio: config.scale_up_ratio,
            scale_down_ratio: config.scale_down_ratio,
        }
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from(&ScalingConfig::default())
    }
}

/// One family's load at the moment of evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyLoad {
    pub members: usize,
    pub unlocked: usize,
    pub players: usize,
    /// Sum of the player soft caps of unlocked members.
    pub capacity: usize,
    /// Member soft and hard caps from the family configuration.
    pub soft_cap: usize,
    pub hard_cap: usize,
}

impl FamilyLoad {
    /// Players per unit of soft capacity. No capacity at all counts as
    /// saturated.
    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            f64::INFINITY
        } else {
            self.players as f64 / self.capacity as f64
        }
    }

    pub fn soft_cap_breached(&self) -> bool {
        self.members >= self.soft_cap
    }
}

/// Streak counters for one family.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pressure {
    pub breached: u32,
    pub idle: u32,
}

impl Pressure {
    /// Fold one interval's load in and decide.
    ///
    /// A streak that produces a recommendation starts over, so a sustained
    /// condition is reported once every `consecutive_intervals` ticks.
    pub fn observe(&mut self, load: &FamilyLoad, policy: &ScalingPolicy) -> Recommendation {
        let ratio = load.ratio();
        let crowded = load.soft_cap_breached();
        let can_grow = load.members < load.hard_cap;
        let can_shrink = load.members > 1 && !crowded;

        if (crowded || ratio >= policy.scale_up_ratio) && can_grow {
            self.idle = 0;
            self.breached += 1;
            if self.breached >= policy.consecutive_intervals {
                self.breached = 0;
                return Recommendation::ScaleUp;
            }
        } else if ratio <= policy.scale_down_ratio && can_shrink {
            self.breached = 0;
            self.idle += 1;
            if self.idle >= policy.consecutive_intervals {
                self.idle = 0;
                return Recommendation::ScaleDown;
            }
        } else {
            self.breached = 0;
            self.idle = 0;
        }
        Recommendation::NoAction
    }
}
