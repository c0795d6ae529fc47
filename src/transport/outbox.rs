//! Messages held while a transport is disconnected.

use std::collections::VecDeque;

use crate::config::schema::Backpressure;
use crate::error::TransportError;

/// Bounded FIFO applying the configured backpressure policy.
#[derive(Debug)]
pub struct Outbox {
    policy: Backpressure,
    capacity: usize,
    queue: VecDeque<String>,
}

impl Outbox {
    pub fn new(policy: Backpressure, capacity: usize) -> Self {
        Self {
            policy,
            capacity,
            queue: VecDeque::new(),
        }
    }

    /// Hold a message published while disconnected.
    pub fn hold(&mut self, message: String) -> Result<(), TransportError> {
        match self.policy {
            Backpressure::FailFast => Err(TransportError::Disconnected),
            Backpressure::Queue if self.queue.len() >= self.capacity => {
                Err(TransportError::QueueFull(self.capacity))
            }
            Backpressure::Queue => {
                self.queue.push_back(message);
                Ok(())
            }
        }
    }

    /// Take every held message in publish order.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
