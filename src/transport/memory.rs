//! In-process broadcast bus.
//!
//! Used when the proxy and its loaders share a process, and by tests. The
//! connection state can be driven by hand to exercise reconnect handling.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::config::schema::{Backpressure, TransportConfig};
use crate::error::TransportError;
use crate::transport::outbox::Outbox;
use crate::transport::{ConnectionState, MessageBus};

struct BusInner {
    state: ConnectionState,
    outbox: Outbox,
}

/// Broadcast bus backed by a Tokio broadcast channel.
pub struct MemoryBus {
    channel: String,
    tx: broadcast::Sender<String>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<BusInner>,
}

impl MemoryBus {
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_policy(channel, Backpressure::Queue, 1024, 1024)
    }

    pub fn from_config(channel: impl Into<String>, config: &TransportConfig) -> Self {
        Self::with_policy(
            channel,
            config.backpressure,
            config.queue_capacity,
            config.subscriber_buffer,
        )
    }

    pub fn with_policy(
        channel: impl Into<String>,
        policy: Backpressure,
        queue_capacity: usize,
        subscriber_buffer: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(subscriber_buffer.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            channel: channel.into(),
            tx,
            state_tx,
            inner: Mutex::new(BusInner {
                state: ConnectionState::Connected,
                outbox: Outbox::new(policy, queue_capacity),
            }),
        }
    }

    /// Force a connection state, flushing held messages when it becomes
    /// `Connected`.
    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state == state {
            return;
        }
        inner.state = state;
        if state == ConnectionState::Connected {
            let held = inner.outbox.drain();
            tracing::debug!(channel = %self.channel, flushed = held.len(), "Memory bus reconnected");
            for message in held {
                let _ = self.tx.send(message);
            }
        }
        self.state_tx.send_replace(state);
    }

    /// Messages currently held by the outbox.
    pub fn held(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.outbox.len(),
            Err(poisoned) => poisoned.into_inner().outbox.len(),
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(&self, message: String) -> Result<(), TransportError> {
        // State check and send happen under one lock so a reconnect flush can
        // never interleave with a new publish.
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.state != ConnectionState::Connected {
            return inner.outbox.hold(message);
        }
        // No receivers is not an error on a broadcast medium.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
