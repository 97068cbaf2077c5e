//! Configuration file watcher for hot reload.
//!
//! Editors often write a file in several steps, and each step fires an
//! event. Only a reload that changes at least one section is forwarded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{AppConfig, STARTUP_ONLY};

/// Reloads the file and remembers the last config it forwarded.
struct Reloader {
    path: PathBuf,
    current: AppConfig,
}

impl Reloader {
    /// The reloaded config, or `None` when it fails to load or no section
    /// changed.
    fn reload(&mut self) -> Option<AppConfig> {
        let next = match load_config(&self.path) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                return None;
            }
        };

        let changed = self.current.changed_sections(&next);
        if changed.is_empty() {
            tracing::debug!(path = ?self.path, "Config file touched without changes");
            return None;
        }
        let restart: Vec<_> = changed
            .iter()
            .copied()
            .filter(|section| STARTUP_ONLY.contains(section))
            .collect();
        tracing::info!(sections = ?changed, restart_required = ?restart, "Config change detected");

        self.current = next.clone();
        Some(next)
    }
}

/// Watches the configuration file and sends changed configs.
pub struct ConfigWatcher {
    reloader: Reloader,
    update_tx: mpsc::UnboundedSender<AppConfig>,
}

impl ConfigWatcher {
    /// Watch `path`, comparing reloads against `current`.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, current: AppConfig) -> (Self, mpsc::UnboundedReceiver<AppConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                reloader: Reloader {
                    path: path.to_path_buf(),
                    current,
                },
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher { mut reloader, update_tx } = self;
        let path = reloader.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if let Some(next) = reloader.reload() {
                        let _ = update_tx.send(next);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
