use crate::config::TriggerWatchConfig;
use crate::error::{OrchestratorError, Result};
use crate::event::{Event, EventSink};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Trigger key for `path` under `root`: `<name>/<relative path>`
///
/// `None` when `path` is not below `root`.
pub fn trigger_key(name: &str, root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("{}/{}", name, parts.join("/")))
}

/// Polls one directory for new or renamed trigger files
///
/// Only the file's appearance matters; its content is left to the handler.
/// Files present before the watcher starts are not reported.
pub struct TriggerWatcher {
    config: TriggerWatchConfig,
    /// Canonical form of `config.directory`, when it resolves
    canonical: Option<PathBuf>,
    poll_interval: Duration,
}

impl TriggerWatcher {
    pub fn new(config: TriggerWatchConfig, poll_interval: Duration) -> Self {
        let canonical = std::fs::canonicalize(&config.directory).ok();
        Self {
            config,
            canonical,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Map a filesystem notification to trigger events
    pub fn classify(&self, event: &notify::Event) -> Vec<Event> {
        let appeared = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        if !appeared {
            return Vec::new();
        }

        event
            .paths
            .iter()
            .filter(|path| self.config.is_marker(path) && !path.is_dir())
            .filter_map(|path| {
                let key = self.key_for(path)?;
                Some(Event::FileTrigger {
                    key,
                    path: path.clone(),
                })
            })
            .collect()
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        trigger_key(&self.config.name, &self.config.directory, path).or_else(|| {
            self.canonical
                .as_deref()
                .and_then(|root| trigger_key(&self.config.name, root, path))
        })
    }

    /// Watch until shutdown
    ///
    /// # Errors
    ///
    /// `OrchestratorError::Config` when the directory cannot be watched.
    pub async fn run(self, sink: EventSink) -> Result<()> {
        let directory = self.config.directory.clone();
        if !directory.is_dir() {
            return Err(OrchestratorError::config(format!(
                "trigger directory {} for watcher '{}' does not exist",
                directory.display(),
                self.config.name
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            },
            NotifyConfig::default().with_poll_interval(self.poll_interval),
        )
        .map_err(|e| OrchestratorError::config(format!("cannot create watcher: {}", e)))?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&directory, mode).map_err(|e| {
            OrchestratorError::config(format!("cannot watch {}: {}", directory.display(), e))
        })?;

        info!(
            "Trigger watcher '{}' watching {} (every {:?})",
            self.config.name,
            directory.display(),
            self.poll_interval
        );

        let shutdown = sink.shutdown_token().clone();
        'watch: loop {
            let res = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = rx.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
            };

            match res {
                Ok(event) => {
                    for trigger in self.classify(&event) {
                        debug!("Trigger {}", trigger);
                        if !sink.emit(trigger).await {
                            // Receiver gone or shutting down
                            break 'watch;
                        }
                    }
                }
                Err(e) => warn!("Trigger watcher '{}' error: {}", self.config.name, e),
            }
        }

        drop(watcher);
        info!("Trigger watcher '{}' stopped", self.config.name);
        Ok(())
    }
}
