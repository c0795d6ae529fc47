//! Shared utilities for magic link integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rusty_connector::config::{FamilyConfig, LinkConfig};
use rusty_connector::link::SessionState;
use rusty_connector::packet::{KeyRing, LinkKey};
use rusty_connector::transport::{MemoryBus, MessageBus};
use rusty_connector::{LoaderLink, LoaderSettings, Proxy, ProxyEvent};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A proxy and any number of loaders sharing one in-memory bus and one
/// deployment key.
pub struct Network {
    pub bus: Arc<MemoryBus>,
    pub proxy: Proxy,
    pub config: LinkConfig,
    seed: String,
}

pub fn config(families: Vec<FamilyConfig>) -> LinkConfig {
    let mut config = LinkConfig {
        families,
        ..LinkConfig::default()
    };
    // Tests drive scaling explicitly.
    config.scaling.enabled = false;
    config
}

impl Network {
    pub fn start(config: LinkConfig) -> Self {
        let bus = Arc::new(MemoryBus::new(config.link.channel.clone()));
        let key = LinkKey::generate();
        let seed = key.to_base64();
        let proxy = Proxy::with_key(&config, Arc::clone(&bus) as Arc<dyn MessageBus>, key).unwrap();
        proxy.start();
        Self {
            bus,
            proxy,
            config,
            seed,
        }
    }

    /// A loader sharing the deployment key, not yet started.
    pub fn loader(&self, settings: LoaderSettings) -> Arc<LoaderLink> {
        let mut trusted = KeyRing::new();
        trusted.trust(self.proxy.verifying_key());
        LoaderLink::new(
            Uuid::new_v4(),
            settings,
            Arc::clone(&self.bus) as Arc<dyn MessageBus>,
            LinkKey::from_base64(&self.seed).unwrap(),
            trusted,
            &self.config,
        )
        .unwrap()
    }

    /// Start a loader in `family` and wait for the proxy's answer.
    pub async fn join(&self, family: &str) -> Arc<LoaderLink> {
        let loader = self.loader(LoaderSettings::new(family, "127.0.0.1:25565"));
        loader.start().await.unwrap();
        wait_for_answer(&loader).await;
        loader
    }

    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.proxy.subscribe()
    }
}

/// Wait until the loader leaves `PendingVerification`.
pub async fn wait_for_answer(loader: &LoaderLink) -> SessionState {
    let mut state = loader.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = *state.borrow_and_update();
            if current != SessionState::PendingVerification && current != SessionState::Unregistered {
                return current;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("loader never got an answer")
}

/// Poll `check` until it holds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Everything currently queued on an event receiver.
pub fn drain(events: &mut broadcast::Receiver<ProxyEvent>) -> Vec<ProxyEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
