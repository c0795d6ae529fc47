//! Identification → handler registry.
//!
//! A flat map consulted for every verified packet. Handlers are async
//! closures registered at startup; unknown identifications are reported back
//! as [`Dispatch::Unhandled`] so the caller can drop them quietly.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;

use crate::error::{LinkError, PacketError};
use crate::packet::envelope::Packet;
use crate::packet::identification::PacketIdentification;

pub type HandlerFuture = BoxFuture<'static, Result<(), LinkError>>;

type HandlerFn = dyn Fn(Packet) -> HandlerFuture + Send + Sync + 'static;

/// Outcome of handing a packet to the registry.
#[derive(Debug)]
pub enum Dispatch {
    /// A handler ran; carries its result.
    Handled(Result<(), LinkError>),
    /// No handler is registered for this identification.
    Unhandled,
}

#[derive(Default)]
pub struct PacketRegistry {
    handlers: DashMap<PacketIdentification, Arc<HandlerFn>>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `identification`.
    ///
    /// Each identification has exactly one handler; a second registration is
    /// refused rather than silently replacing the first.
    pub fn register<F, Fut>(&self, identification: PacketIdentification, handler: F) -> Result<(), PacketError>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        match self.handlers.entry(identification) {
            Entry::Occupied(entry) => Err(PacketError::IdentificationCollision(
                entry.key().as_str().to_string(),
            )),
            Entry::Vacant(entry) => {
                let handler: Arc<HandlerFn> =
                    Arc::new(move |packet| -> HandlerFuture { Box::pin(handler(packet)) });
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, identification: &PacketIdentification) -> bool {
        self.handlers.contains_key(identification)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for the packet's identification.
    pub async fn dispatch(&self, packet: Packet) -> Dispatch {
        // Clone the handler out so no map shard lock is held across the await.
        let handler = match self.handlers.get(packet.identification()) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Dispatch::Unhandled,
        };
        Dispatch::Handled(handler(packet).await)
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|e| e.key().as_str().to_string())
            .collect();
        names.sort();
        f.debug_struct("PacketRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn packet(identification: PacketIdentification) -> Packet {
        Packet::builder(Uuid::new_v4())
            .identification(identification)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_by_identification() {
        let registry = PacketRegistry::new();
        let locks = Arc::new(AtomicUsize::new(0));
        let counter = locks.clone();
        registry
            .register(PacketIdentification::LOCK_SERVER, move |_packet| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        assert!(matches!(
            registry.dispatch(packet(PacketIdentification::LOCK_SERVER)).await,
            Dispatch::Handled(Ok(()))
        ));
        assert!(matches!(
            registry.dispatch(packet(PacketIdentification::UNLOCK_SERVER)).await,
            Dispatch::Unhandled
        ));
        assert_eq!(locks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let registry = PacketRegistry::new();
        registry
            .register(PacketIdentification::HEARTBEAT, |_| async { Ok(()) })
            .unwrap();
        let second = registry.register(PacketIdentification::HEARTBEAT, |_| async { Ok(()) });
        assert!(matches!(second, Err(PacketError::IdentificationCollision(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_errors_are_returned() {
        let registry = PacketRegistry::new();
        registry
            .register(PacketIdentification::DEREGISTER, |_| async {
                Err(LinkError::Handler("boom".into()))
            })
            .unwrap();
        let outcome = registry.dispatch(packet(PacketIdentification::DEREGISTER)).await;
        assert!(matches!(outcome, Dispatch::Handled(Err(LinkError::Handler(_)))));
    }
}
