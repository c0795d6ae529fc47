//! Audit cache of received control messages.
//!
//! # Responsibilities
//! - Give every received message a snowflake id and a status
//! - Suppress replays: a correlation id is processed at most once, and
//!   messages older than the replay window are refused
//! - Stay bounded: the oldest entries fall out past `capacity`
//!
//! # Design Decisions
//! - Only verified packets mark their correlation id as seen, so a forged
//!   copy cannot burn the id of a genuine packet
//! - Snowflakes are 41 bits of milliseconds since 2024-01-01, 10 bits of
//!   node id and 12 bits of sequence

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::config::schema::CacheConfig;
use crate::error::VerificationError;
use crate::packet::now_millis;

const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Time-ordered unique ids.
#[derive(Debug)]
pub struct Snowflake {
    node: u64,
    state: Mutex<(u64, u64)>,
}

impl Snowflake {
    pub fn new(node: u16) -> Self {
        Self {
            node: u64::from(node) & ((1 << NODE_BITS) - 1),
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (last, sequence) = *state;
        let now = now_millis().saturating_sub(EPOCH_MILLIS).max(last);
        // Sequence exhaustion borrows the next millisecond.
        let (millis, sequence) = if now == last {
            let next = (sequence + 1) & SEQUENCE_MASK;
            if next == 0 {
                (last + 1, 0)
            } else {
                (last, next)
            }
        } else {
            (now, 0)
        };
        *state = (millis, sequence);
        (millis << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | sequence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Received, not yet processed.
    Pending,
    /// Handed to its handler, which succeeded.
    Sent,
    /// Refused before reaching a handler (verification, replay, no handler).
    Blocked,
    /// The handler returned an error.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheableMessage {
    pub snowflake: u64,
    pub correlation_id: Uuid,
    pub contents: String,
    pub sent_at: u64,
    pub status: MessageStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Entries {
    order: VecDeque<u64>,
    messages: HashMap<u64, CacheableMessage>,
    /// Correlation id → receive time (unix millis) of processed packets.
    seen: HashMap<Uuid, u64>,
    /// The same ids in the order they were admitted.
    seen_order: VecDeque<(u64, Uuid)>,
}

impl Entries {
    /// Drop seen ids older than the window, oldest first.
    fn expire_seen(&mut self, now: u64, window: u64) {
        while let Some(&(seen_at, id)) = self.seen_order.front() {
            if now.saturating_sub(seen_at) <= window {
                break;
            }
            self.seen_order.pop_front();
            self.seen.remove(&id);
        }
    }
}

#[derive(Debug)]
pub struct MessageCache {
    ids: Snowflake,
    capacity: usize,
    replay_window_ms: u64,
    entries: Mutex<Entries>,
}

impl MessageCache {
    pub fn new(config: &CacheConfig, node: u16) -> Self {
        Self {
            ids: Snowflake::new(node),
            capacity: config.capacity.max(1),
            replay_window_ms: config.replay_window_secs.saturating_mul(1000),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Record a received message as `Pending` and return its snowflake.
    pub fn record(&self, correlation_id: Uuid, contents: impl Into<String>, sent_at: u64) -> u64 {
        let snowflake = self.ids.next_id();
        let message = CacheableMessage {
            snowflake,
            correlation_id,
            contents: contents.into(),
            sent_at,
            status: MessageStatus::Pending,
            reason: None,
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.order.push_back(snowflake);
        entries.messages.insert(snowflake, message);
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.messages.remove(&oldest);
            }
        }
        snowflake
    }

    /// Accept a verified packet for processing, or refuse it as a replay.
    ///
    /// On success the correlation id is remembered for the replay window.
    pub fn admit(&self, correlation_id: Uuid, sent_at: u64) -> Result<(), VerificationError> {
        let now = now_millis();
        if now.saturating_sub(sent_at) > self.replay_window_ms
            || sent_at.saturating_sub(now) > self.replay_window_ms
        {
            return Err(VerificationError::Stale);
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.expire_seen(now, self.replay_window_ms);
        if entries.seen.contains_key(&correlation_id) {
            return Err(VerificationError::Replayed(correlation_id));
        }
        entries.seen.insert(correlation_id, now);
        entries.seen_order.push_back((now, correlation_id));
        Ok(())
    }

    pub fn set_status(&self, snowflake: u64, status: MessageStatus, reason: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(message) = entries.messages.get_mut(&snowflake) {
            message.status = status;
            message.reason = reason;
        }
    }

    pub fn get(&self, snowflake: u64) -> Option<CacheableMessage> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.messages.get(&snowflake).cloned()
    }

    /// Cached messages, oldest first.
    pub fn messages(&self) -> Vec<CacheableMessage> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .order
            .iter()
            .filter_map(|id| entries.messages.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
