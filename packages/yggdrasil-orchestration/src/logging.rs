//! Logging setup and span constructors
//!
//! `RUST_LOG` wins when set; otherwise `info`, or `debug` under `--dev`.
//! With a log directory configured, a plain-text copy goes to
//! `<dir>/yggdrasil.log` next to the stderr output.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

pub const LOG_FILE_NAME: &str = "yggdrasil.log";

#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub dev: bool,
    pub log_dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn default_level(&self) -> &'static str {
        if self.dev {
            "debug"
        } else {
            "info"
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(settings: &LogSettings) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.default_level()));

        let file_layer = settings
            .log_dir
            .as_deref()
            .and_then(|dir| match open_log_file(dir) {
                Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
                Err(e) => {
                    eprintln!("yggdrasil: cannot open log file in {}: {}", dir.display(), e);
                    None
                }
            });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .try_init();
    });
}

fn open_log_file(dir: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

/// Span wrapping one dispatched handler run
#[must_use]
pub fn project_span(doc_id: &str, handler: &str) -> Span {
    tracing::info_span!("project", doc_id = doc_id, handler = handler)
}

/// Span wrapping one trigger handler run
#[must_use]
pub fn trigger_span(key: &str, handler: &str) -> Span {
    tracing::info_span!("trigger", key = key, handler = handler)
}
