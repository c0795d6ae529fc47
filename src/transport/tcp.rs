//! TCP client for the bus relay.
//!
//! # Responsibilities
//! - Keep one connection to the relay, reconnecting with backoff
//! - Write published lines in order, re-sending a line whose write failed
//! - Forward every received line to local subscribers
//! - Surface Connected → Disconnected → Reconnecting → Connected
//!
//! # Design Decisions
//! - The outbound channel doubles as the disconnect queue (Queue policy)
//! - FailFast refuses publishes unless the state is Connected

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::config::schema::{Backpressure, TransportConfig};
use crate::error::TransportError;
use crate::resilience::backoff::ReconnectBackoff;
use crate::transport::relay::MAX_LINE_LENGTH;
use crate::transport::{ConnectionState, MessageBus};

pub struct TcpBus {
    channel: String,
    outbound: mpsc::Sender<String>,
    inbound: broadcast::Sender<String>,
    state_rx: watch::Receiver<ConnectionState>,
    policy: Backpressure,
    capacity: usize,
    task: JoinHandle<()>,
}

impl TcpBus {
    /// Start connecting to the relay at `config.address`.
    ///
    /// Returns immediately; the connection is established in the background.
    pub fn connect(
        channel: impl Into<String>,
        config: &TransportConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (inbound, _) = broadcast::channel(config.subscriber_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = ConnectionWorker {
            address: config.address.clone(),
            backoff: ReconnectBackoff::from_config(config),
            outbound_rx,
            inbound: inbound.clone(),
            state_tx,
            pending: None,
        };
        let task = tokio::spawn(worker.run(shutdown));

        Self {
            channel: channel.into(),
            outbound,
            inbound,
            state_rx,
            policy: config.backpressure,
            capacity,
            task,
        }
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl MessageBus for TcpBus {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(&self, message: String) -> Result<(), TransportError> {
        if self.policy == Backpressure::FailFast
            && *self.state_rx.borrow() != ConnectionState::Connected
        {
            return Err(TransportError::Disconnected);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

enum SessionEnd {
    Lost,
    Shutdown,
}

struct ConnectionWorker {
    address: String,
    backoff: ReconnectBackoff,
    outbound_rx: mpsc::Receiver<String>,
    inbound: broadcast::Sender<String>,
    state_tx: watch::Sender<ConnectionState>,
    /// A line whose write failed; sent first after reconnecting.
    pending: Option<String>,
}

impl ConnectionWorker {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let connected = tokio::select! {
                result = TcpStream::connect(&self.address) => result,
                _ = shutdown.recv() => return,
            };

            match connected {
                Ok(stream) => {
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(address = %self.address, "Connected to bus relay");
                    match self.session(stream, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Lost => {
                            self.set_state(ConnectionState::Disconnected);
                            tracing::warn!(address = %self.address, "Lost connection to bus relay");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %self.address, attempt = self.backoff.attempt() + 1, error = %e, "Bus relay connect failed");
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn session(&mut self, stream: TcpStream, shutdown: &mut broadcast::Receiver<()>) -> SessionEnd {
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut sink = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        if let Some(line) = self.pending.take() {
            if sink.send(line.clone()).await.is_err() {
                self.pending = Some(line);
                return SessionEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                line = lines.next() => {
                    match line {
                        Some(Ok(line)) => {
                            let _ = self.inbound.send(line);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Dropped unreadable line from relay");
                        }
                        None => return SessionEnd::Lost,
                    }
                }
                message = self.outbound_rx.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message.clone()).await {
                                tracing::debug!(error = %e, "Relay write failed, will resend after reconnect");
                                self.pending = Some(message);
                                return SessionEnd::Lost;
                            }
                        }
                        // Every bus handle is gone.
                        None => return SessionEnd::Shutdown,
                    }
                }
                _ = shutdown.recv() => return SessionEnd::Shutdown,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::transport::BusRelay;
    use std::time::Duration;

    fn config(address: String, backpressure: Backpressure) -> TransportConfig {
        TransportConfig {
            address,
            backpressure,
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 50,
            ..TransportConfig::default()
        }
    }

    async fn wait_connected(bus: &TcpBus) {
        let mut state = bus.connection_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != ConnectionState::Connected {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("bus never connected");
    }

    #[tokio::test]
    async fn test_relay_fans_out_between_clients() {
        let shutdown = Shutdown::new();
        let relay = BusRelay::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = relay.local_addr().unwrap().to_string();
        tokio::spawn(relay.run(shutdown.subscribe()));

        let a = TcpBus::connect("test", &config(addr.clone(), Backpressure::Queue), shutdown.subscribe());
        let b = TcpBus::connect("test", &config(addr, Backpressure::Queue), shutdown.subscribe());
        wait_connected(&a).await;
        wait_connected(&b).await;
        // Give the relay a moment to subscribe both peers.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rx = b.subscribe();
        a.publish("first".into()).await.unwrap();
        a.publish("second".into()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_fail_fast_without_relay() {
        let shutdown = Shutdown::new();
        // Nothing listens on port 1.
        let bus = TcpBus::connect("test", &config("127.0.0.1:1".into(), Backpressure::FailFast), shutdown.subscribe());
        let result = bus.publish("hello".into()).await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_queue_policy_accepts_while_disconnected() {
        let shutdown = Shutdown::new();
        let mut cfg = config("127.0.0.1:1".into(), Backpressure::Queue);
        cfg.queue_capacity = 2;
        let bus = TcpBus::connect("test", &cfg, shutdown.subscribe());

        bus.publish("a".into()).await.unwrap();
        bus.publish("b".into()).await.unwrap();
        assert!(matches!(bus.publish("c".into()).await, Err(TransportError::QueueFull(2))));
        shutdown.trigger();
    }
}
