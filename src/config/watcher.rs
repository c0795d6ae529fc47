//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::LinkConfig;

/// Watches the configuration file and emits every valid revision.
///
/// Invalid revisions are logged and skipped; the running configuration stays.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<LinkConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<LinkConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = ?path, "Config file change detected, reloading");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_emits_reloaded_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[families]]\nid = \"lobby\"").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(file.path());
        let _guard = watcher.run().unwrap();

        {
            let mut handle = std::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(file.path())
                .unwrap();
            writeln!(handle, "[[families]]\nid = \"lobby\"\n\n[[families]]\nid = \"bedwars\"\nparent = \"lobby\"").unwrap();
            handle.sync_all().unwrap();
        }

        let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let config = rx.recv().await.expect("watcher channel closed");
                if config.families.len() == 2 {
                    return config;
                }
            }
        })
        .await
        .expect("no reload observed");
        assert_eq!(reloaded.families[1].parent.as_deref(), Some("lobby"));
    }
}
