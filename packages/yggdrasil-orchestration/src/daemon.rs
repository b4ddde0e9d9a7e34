//! Process entry points: `daemon` and `run-doc`
//!
//! [`bootstrap`] wires the production components (CouchDB, Slurm, the
//! registry from the mapping file and plugin manifests) into an
//! [`AppContext`]. Both entry points take the context as given, so tests run
//! them against the in-memory store and a scripted scheduler.

use crate::config::{SessionFlags, YggdrasilConfig};
use crate::context::AppContext;
use crate::dispatcher::{Dispatcher, ProjectReport, TaskReport};
use crate::error::{OrchestratorError, Result};
use crate::event::{self, Event, Signal};
use crate::realms::FactoryCatalog;
use crate::registry::HandlerRegistry;
use crate::slurm::SlurmScheduler;
use crate::sources::{MappingFileSource, PluginManifestSource};
use crate::watcher::{ChangePoller, TriggerWatcher};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use yggdrasil_storage::{CouchDbConfig, CouchDbStore};

/// Build the registry from the mapping file and, if configured, plugin manifests
pub fn build_registry(config: &YggdrasilConfig, catalog: Arc<FactoryCatalog>) -> Result<HandlerRegistry> {
    let mut builder = HandlerRegistry::builder();

    let mapping = MappingFileSource::new(&config.module_registry, catalog.clone());
    let count = builder.load(&mapping)?;
    info!(
        "Loaded {} registration(s) from {}",
        count,
        config.module_registry.display()
    );

    if let Some(dir) = &config.plugin_dir {
        builder.load(&PluginManifestSource::new(dir, catalog))?;
    }

    let registry = builder.build();
    if registry.is_empty() {
        warn!("No handlers registered; every project will be marked unhandled");
    }
    Ok(registry)
}

/// Wire the production components
///
/// # Errors
///
/// Anything that goes wrong here is a startup failure: an unreachable store,
/// a bad registry, an invalid URL.
pub async fn bootstrap(config: YggdrasilConfig, session: SessionFlags) -> Result<AppContext> {
    let couch = CouchDbConfig::new(
        config.couchdb_url.as_str(),
        config.couchdb_database.as_str(),
        config.couchdb_status_tracking.as_str(),
    )
    .with_credentials(config.couchdb_user.clone(), config.couchdb_password.clone());

    let store = CouchDbStore::new(couch).map_err(OrchestratorError::config)?;
    store.ensure_databases().await?;
    info!(
        "Connected to CouchDB at {} (projects: '{}', status: '{}')",
        config.couchdb_url, config.couchdb_database, config.couchdb_status_tracking
    );

    let registry = build_registry(&config, Arc::new(FactoryCatalog::with_builtins()))?;
    let scheduler = Arc::new(SlurmScheduler::new(&config.slurm));

    Ok(AppContext::new(
        config,
        session,
        Arc::new(store),
        registry,
        scheduler,
    ))
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Cancel `token` once a shutdown signal arrives
fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = shutdown_signal() => token.cancel(),
        }
    })
}

/// Long-running daemon: watchers + dispatcher until shutdown
pub struct Daemon {
    ctx: AppContext,
    listen_for_signals: bool,
}

impl Daemon {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            listen_for_signals: true,
        }
    }

    /// Leave shutdown to the context's token (embedders and tests)
    pub fn without_signal_handlers(mut self) -> Self {
        self.listen_for_signals = false;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled
    ///
    /// # Errors
    ///
    /// `OrchestratorError::Config` if a trigger directory is missing; nothing
    /// after startup ends the daemon except shutdown.
    pub async fn run(self) -> Result<()> {
        let ctx = self.ctx;
        for watch in &ctx.config.trigger_watch {
            if !watch.directory.is_dir() {
                return Err(OrchestratorError::config(format!(
                    "trigger directory {} for watcher '{}' does not exist",
                    watch.directory.display(),
                    watch.name
                )));
            }
        }

        let signals = self
            .listen_for_signals
            .then(|| cancel_on_signal(ctx.shutdown.clone()));

        let (sink, events) = event::channel(ctx.shutdown.clone());

        // Recovery first: projects a previous process left mid-pipeline
        sink.emit(Event::ExternalSignal(Signal::Rescan)).await;

        let mut watchers: JoinSet<Result<()>> = JoinSet::new();
        let poller = ChangePoller::new(ctx.store.clone(), ctx.config.poll_interval());
        let poller_sink = sink.clone();
        watchers.spawn(async move {
            poller.run(poller_sink).await;
            Ok(())
        });
        for watch in &ctx.config.trigger_watch {
            let watcher = TriggerWatcher::new(watch.clone(), ctx.config.poll_interval());
            watchers.spawn(watcher.run(sink.clone()));
        }
        drop(sink);

        info!(
            "Yggdrasil daemon running ({} trigger watcher(s){})",
            ctx.config.trigger_watch.len(),
            if ctx.session.manual_submit {
                ", manual submission"
            } else {
                ""
            }
        );

        Dispatcher::new(ctx.clone()).run(events).await;

        // Dispatcher only returns on shutdown or when every sender is gone
        ctx.shutdown.cancel();
        let grace = ctx.config.grace_period();
        let stopped = tokio::time::timeout(grace, async {
            while let Some(joined) = watchers.join_next().await {
                match joined {
                    Ok(Err(e)) => error!("Watcher stopped with error: {}", e),
                    Err(e) => error!("Watcher task ended abnormally: {}", e),
                    Ok(Ok(())) => {}
                }
            }
        })
        .await;
        if stopped.is_err() {
            warn!("Watchers did not stop within {:?}; aborting", grace);
            watchers.abort_all();
        }

        if let Some(signals) = signals {
            signals.abort();
        }
        info!("Yggdrasil daemon stopped");
        Ok(())
    }
}

/// Handle one project to a terminal status (or until shutdown)
///
/// Dispatches a synthetic `ProjectChanged` for `doc_id` through a private
/// dispatcher and returns its report.
pub async fn run_doc(ctx: AppContext, doc_id: &str) -> ProjectReport {
    let signals = cancel_on_signal(ctx.shutdown.clone());
    let mut dispatcher = Dispatcher::new(ctx);

    dispatcher.dispatch(Event::project(doc_id)).await;

    let report = loop {
        match dispatcher.join_next().await {
            Some(TaskReport::Project(report)) if report.doc_id == doc_id => break report,
            Some(_) => continue,
            None => {
                let mut report = ProjectReport::new(doc_id);
                report.cause = Some("project was not dispatched".to_string());
                break report;
            }
        }
    };

    signals.abort();
    report
}
