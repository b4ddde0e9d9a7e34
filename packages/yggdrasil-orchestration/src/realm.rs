use crate::config::{SessionFlags, YggdrasilConfig};
use crate::error::Result;
use crate::job_monitor::{JobHandle, JobMonitor, JobResult, SubmissionMode};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use yggdrasil_storage::{ProjectDocument, ProjectStore};

/// Result of one handler step
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Domain work done; the project moves to `Finalizing → Completed`
    Completed,
    /// An external job was bound through the job monitor
    AwaitingJob(JobHandle),
    Failed(String),
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed(reason.into())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::AwaitingJob(_) => "awaiting_job",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Services a handler may use
///
/// Status writes go through the store (or the job monitor, which writes
/// through the store); dispatcher internals are not reachable from here.
#[derive(Clone)]
pub struct RealmServices {
    store: Arc<dyn ProjectStore>,
    job_monitor: Arc<JobMonitor>,
    config: Arc<YggdrasilConfig>,
    session: SessionFlags,
    shutdown: CancellationToken,
}

impl RealmServices {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        job_monitor: Arc<JobMonitor>,
        config: Arc<YggdrasilConfig>,
        session: SessionFlags,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            job_monitor,
            config,
            session,
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn job_monitor(&self) -> &Arc<JobMonitor> {
        &self.job_monitor
    }

    pub fn config(&self) -> &YggdrasilConfig {
        &self.config
    }

    pub fn session(&self) -> SessionFlags {
        self.session
    }

    /// Cancelled when the process is shutting down
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// HPC submission policy
    ///
    /// Automatic only when the session did not force manual submission, the
    /// document does not opt out (`"auto_submit": false`), and the realm
    /// supports automatic submission.
    pub fn submission_mode(
        &self,
        doc: &ProjectDocument,
        handler: &dyn RealmHandler,
    ) -> SubmissionMode {
        let forced_manual = self.session.manual_submit || doc.manual_submit;
        if !forced_manual && doc.auto_submit() && handler.supports_auto_submit() {
            SubmissionMode::Automatic
        } else {
            SubmissionMode::Manual
        }
    }
}

/// Realm handler trait (pluggable pipeline modules)
#[async_trait]
pub trait RealmHandler: Send + Sync {
    /// Name used in logs and spans
    fn name(&self) -> &str;

    /// Claim a classification key outside the registry's key matching
    ///
    /// Consulted only for handlers added with `register_internal`.
    fn matches(&self, _library_prep_method: &str) -> bool {
        false
    }

    /// Whether the realm may submit jobs without an operator
    fn supports_auto_submit(&self) -> bool {
        true
    }

    /// Run the realm's processing for one project
    async fn handle(&self, doc: &ProjectDocument, services: &RealmServices) -> Result<Outcome>;

    /// Decide the project's fate once its external job has finished
    async fn on_job_finished(
        &self,
        _doc: &ProjectDocument,
        result: JobResult,
        _services: &RealmServices,
    ) -> Result<Outcome> {
        Ok(match result {
            JobResult::Succeeded => Outcome::Completed,
            other => Outcome::Failed(format!("external job {}", other)),
        })
    }

    /// React to a trigger file
    async fn handle_trigger(&self, _path: &Path, _services: &RealmServices) -> Result<Outcome> {
        Ok(Outcome::Failed(format!(
            "{} does not handle trigger files",
            self.name()
        )))
    }
}

/// Builds a handler instance from registration options
///
/// Called once per registration at startup.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, options: &Value) -> Result<Arc<dyn RealmHandler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn RealmHandler>> + Send + Sync,
{
    fn create(&self, options: &Value) -> Result<Arc<dyn RealmHandler>> {
        self(options)
    }
}

/// Handler backed by an async closure
///
/// # Example
/// ```ignore
/// let realm = FnRealm::new("noop", |_doc, _services| async { Ok(Outcome::Completed) });
/// ```
pub struct FnRealm<F> {
    name: String,
    handle: F,
    auto_submit: bool,
}

impl<F> FnRealm<F> {
    pub fn new(name: impl Into<String>, handle: F) -> Self {
        Self {
            name: name.into(),
            handle,
            auto_submit: true,
        }
    }

    pub fn manual_only(mut self) -> Self {
        self.auto_submit = false;
        self
    }
}

#[async_trait]
impl<F, Fut> RealmHandler for FnRealm<F>
where
    F: Fn(ProjectDocument, RealmServices) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_auto_submit(&self) -> bool {
        self.auto_submit
    }

    async fn handle(&self, doc: &ProjectDocument, services: &RealmServices) -> Result<Outcome> {
        (self.handle)(doc.clone(), services.clone()).await
    }
}
