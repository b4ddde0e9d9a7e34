use crate::config::{SessionFlags, YggdrasilConfig};
use crate::job_monitor::{JobMonitor, JobScheduler};
use crate::realm::RealmServices;
use crate::registry::HandlerRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use yggdrasil_storage::ProjectStore;

/// Process-wide components, built once at startup and passed explicitly
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<YggdrasilConfig>,
    pub session: SessionFlags,
    pub store: Arc<dyn ProjectStore>,
    pub registry: Arc<HandlerRegistry>,
    pub job_monitor: Arc<JobMonitor>,
    /// Cancelled once on shutdown; every loop and handler observes it
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(
        config: YggdrasilConfig,
        session: SessionFlags,
        store: Arc<dyn ProjectStore>,
        registry: HandlerRegistry,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let job_monitor = Arc::new(JobMonitor::new(
            store.clone(),
            scheduler,
            config.job_poll_interval(),
            shutdown.clone(),
        ));

        Self {
            config: Arc::new(config),
            session,
            store,
            registry: Arc::new(registry),
            job_monitor,
            shutdown,
        }
    }

    /// Handler-facing view of the context
    pub fn services(&self) -> RealmServices {
        RealmServices::new(
            self.store.clone(),
            self.job_monitor.clone(),
            self.config.clone(),
            self.session,
            self.shutdown.clone(),
        )
    }
}
