//! Configuration hot reload.
//!
//! Watches the config file's directory (so editors that save by renaming a
//! temp file are seen), debounces bursts of events, re-parses the file and
//! applies it to the running [`Router`]. A file that fails to parse or
//! validate is logged and ignored; the router keeps its current settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::error::Result;
use crate::router::Router;

/// Quiet period after the last file event before reloading.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Re-read `path` and apply it to `router`.
pub fn reload(path: &Path, router: &Router) -> Result<()> {
    let (config, _) = Config::from_file_with_env(path)?;
    router.apply_config(&config)
}

/// Live file watcher. Dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path` and apply every valid change to `router`.
    pub fn spawn(
        path: impl Into<PathBuf>,
        router: Router,
        debounce: Duration,
    ) -> std::result::Result<Self, ConfigError> {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| watch_error(&path, e))?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&watch_dir, e))?;

        tracing::info!(path = %path.display(), "Watching configuration for changes");

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !touches(&event, &path) {
                    continue;
                }

                // Absorb the rest of the burst
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                match reload(&path, &router) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Configuration reloaded");
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Configuration reload rejected, keeping current settings"
                        );
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches(event: &notify::Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

fn watch_error(path: &Path, e: notify::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source: std::io::Error::other(e.to_string()),
    }
}
