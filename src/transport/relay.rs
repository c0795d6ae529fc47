//! TCP broadcast relay.
//!
//! # Responsibilities
//! - Accept connections from the proxy and loaders
//! - Fan every received line out to every connected peer (sender included)
//! - Stay up when a peer misbehaves or disconnects
//!
//! The relay does not parse packets. It is the "shared channel" for
//! deployments whose nodes run in separate processes.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Longest accepted line (one serialized packet).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

pub struct BusRelay {
    listener: TcpListener,
    hub: broadcast::Sender<String>,
}

impl BusRelay {
    /// Bind the relay listener.
    pub async fn bind(addr: &str, buffer: usize) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let (hub, _) = broadcast::channel(buffer.max(1));
        tracing::info!(address = %listener.local_addr()?, "Bus relay bound");
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept peers until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "Relay peer connected");
                            let hub = self.hub.clone();
                            tokio::spawn(serve_peer(stream, peer, hub));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Relay accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Bus relay received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

async fn serve_peer(stream: TcpStream, peer: SocketAddr, hub: broadcast::Sender<String>) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut sink = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut outbound = hub.subscribe();

    loop {
        tokio::select! {
            line = lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        let _ = hub.send(line);
                    }
                    Some(Err(e)) => {
                        // Oversized or non-UTF-8 lines are skipped; the codec
                        // resynchronises on the next newline.
                        tracing::warn!(peer = %peer, error = %e, "Relay dropped unreadable line");
                    }
                    None => break,
                }
            }
            message = outbound.recv() => {
                match message {
                    Ok(message) => {
                        if let Err(e) = sink.send(message).await {
                            tracing::debug!(peer = %peer, error = %e, "Relay write failed");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(peer = %peer, skipped, "Relay peer lagging, messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!(peer = %peer, "Relay peer disconnected");
}
