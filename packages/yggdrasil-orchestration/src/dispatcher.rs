//! Dispatcher / scheduler
//!
//! The single control loop. It consumes the merged event stream, claims the
//! event's project (or trigger key) and spawns the handler run as its own
//! task, so one slow project never holds up polling or other projects.
//!
//! ```text
//! ProjectChanged(doc_id)
//!   ├─ doc_id already claimed → coalesced (the next poll re-observes it)
//!   └─ claim → spawn ProjectTask
//!        load → skip terminal → resolve handler (miss → Unhandled)
//!        Received → Queued → Processing → handle()
//!        AwaitingJob → await_completion → on_job_finished
//!        Completed → Finalizing → Completed / Failed(reason) → Failed
//! ```
//!
//! Every error a task raises is contained at its boundary: it is logged and
//! turned into a persisted status, never propagated into the loop.

use crate::context::AppContext;
use crate::error::{OrchestratorError, Result};
use crate::event::{Event, Signal};
use crate::job_monitor::SubmissionMode;
use crate::logging::{project_span, trigger_span};
use crate::project::persist_transition;
use crate::realm::{Outcome, RealmHandler, RealmServices};
use dashmap::DashSet;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;
use yggdrasil_storage::{update_status_record_with_retry, ProjectDocument, ProjectStatus};

/// What `dispatch` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    Spawned,
    /// Same project or trigger already being handled; event dropped
    Coalesced,
    /// Recovery scan re-dispatched this many in-flight projects
    Rescanned(usize),
    ShutdownRequested,
}

/// Final word on one project run
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectReport {
    pub doc_id: String,
    /// Status the run left behind; `None` if the document could not be read
    pub status: Option<ProjectStatus>,
    pub handler: Option<String>,
    pub cause: Option<String>,
}

impl ProjectReport {
    pub fn new(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            status: None,
            handler: None,
            cause: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(ProjectStatus::Completed)
    }
}

impl fmt::Display for ProjectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "doc {}: {}", self.doc_id, status)?,
            None => write!(f, "doc {}: unknown", self.doc_id)?,
        }
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

/// Result of one spawned task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport {
    Project(ProjectReport),
    Trigger {
        key: String,
        handler: Option<String>,
        result: std::result::Result<String, String>,
    },
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskReport::Project(report) => write!(f, "{}", report),
            TaskReport::Trigger { key, result, .. } => match result {
                Ok(outcome) => write!(f, "trigger {}: {}", key, outcome),
                Err(cause) => write!(f, "trigger {}: failed ({})", key, cause),
            },
        }
    }
}

/// Releases a claim when the task finishes, panics or is aborted
struct Claim {
    key: String,
    claims: Arc<DashSet<String>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

pub struct Dispatcher {
    ctx: AppContext,
    claims: Arc<DashSet<String>>,
    limiter: Arc<Semaphore>,
    tasks: JoinSet<TaskReport>,
    report_tx: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl Dispatcher {
    pub fn new(ctx: AppContext) -> Self {
        let limiter = Arc::new(Semaphore::new(ctx.config.max_concurrent_handlers.max(1)));
        Self {
            ctx,
            claims: Arc::new(DashSet::new()),
            limiter,
            tasks: JoinSet::new(),
            report_tx: None,
        }
    }

    /// Forward every finished task's report to `tx`
    pub fn with_report_sink(mut self, tx: mpsc::UnboundedSender<TaskReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    /// Projects and triggers currently being handled
    pub fn in_flight(&self) -> usize {
        self.claims.len()
    }

    pub fn is_claimed(&self, doc_id: &str) -> bool {
        self.claims.contains(doc_id)
    }

    /// Handle one event without waiting for the spawned work
    pub async fn dispatch(&mut self, event: Event) -> DispatchDecision {
        match event {
            Event::ProjectChanged { doc_id } => self.spawn_project(doc_id),
            Event::FileTrigger { key, path } => self.spawn_trigger(key, path),
            Event::ExternalSignal(Signal::Rescan) => self.rescan().await,
            Event::ExternalSignal(Signal::Shutdown) => {
                self.ctx.shutdown.cancel();
                DispatchDecision::ShutdownRequested
            }
        }
    }

    fn claim(&self, key: String) -> Option<Claim> {
        if self.claims.insert(key.clone()) {
            Some(Claim {
                key,
                claims: self.claims.clone(),
            })
        } else {
            None
        }
    }

    fn spawn_project(&mut self, doc_id: String) -> DispatchDecision {
        let claim = match self.claim(doc_id.clone()) {
            Some(claim) => claim,
            None => {
                debug!("Project {} is already being handled; coalescing", doc_id);
                return DispatchDecision::Coalesced;
            }
        };

        let task = ProjectTask {
            services: self.ctx.services(),
            ctx: self.ctx.clone(),
            limiter: self.limiter.clone(),
            doc_id,
        };
        self.tasks.spawn(async move {
            let _claim = claim;
            TaskReport::Project(task.run().await)
        });
        DispatchDecision::Spawned
    }

    fn spawn_trigger(&mut self, key: String, path: PathBuf) -> DispatchDecision {
        let claim = match self.claim(format!("trigger:{}", key)) {
            Some(claim) => claim,
            None => {
                debug!("Trigger {} is already being handled; coalescing", key);
                return DispatchDecision::Coalesced;
            }
        };

        let ctx = self.ctx.clone();
        let limiter = self.limiter.clone();
        self.tasks.spawn(async move {
            let _claim = claim;
            run_trigger(ctx, limiter, key, path).await
        });
        DispatchDecision::Spawned
    }

    /// Re-dispatch every project a previous process left in flight
    async fn rescan(&mut self) -> DispatchDecision {
        let docs = match self.ctx.store.list_in_flight().await {
            Ok(docs) => docs,
            Err(e) => {
                warn!("Recovery scan failed: {}", e);
                return DispatchDecision::Rescanned(0);
            }
        };

        let mut spawned = 0;
        for doc in docs {
            debug!("Recovering {} ({})", doc.doc_id, doc.status);
            if self.spawn_project(doc.doc_id) == DispatchDecision::Spawned {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!("Recovery scan re-dispatched {} in-flight project(s)", spawned);
        }
        DispatchDecision::Rescanned(spawned)
    }

    /// Wait for the next spawned task to finish
    ///
    /// `None` when nothing is running.
    pub async fn join_next(&mut self) -> Option<TaskReport> {
        loop {
            match self.tasks.join_next().await? {
                Ok(report) => {
                    self.publish(&report);
                    return Some(report);
                }
                Err(e) => error!("Handler task ended abnormally: {}", e),
            }
        }
    }

    fn publish(&self, report: &TaskReport) {
        info!("{}", report);
        if let Some(tx) = &self.report_tx {
            let _ = tx.send(report.clone());
        }
    }

    /// Consume events until shutdown or the stream ends, then drain
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let shutdown = self.ctx.shutdown.clone();
        info!(
            "Dispatcher started (max {} concurrent handlers)",
            self.ctx.config.max_concurrent_handlers
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if self.dispatch(event).await == DispatchDecision::ShutdownRequested {
                            break;
                        }
                    }
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(report) => self.publish(&report),
                    Err(e) => error!("Handler task ended abnormally: {}", e),
                },
            }
        }

        self.drain(self.ctx.config.grace_period()).await;
    }

    /// Give running tasks `grace` to finish, then abort the rest
    pub async fn drain(&mut self, grace: Duration) {
        if self.tasks.is_empty() {
            return;
        }
        info!(
            "Waiting up to {:?} for {} handler task(s)",
            grace,
            self.tasks.len()
        );

        let finished = tokio::time::timeout(grace, async {
            while self.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "{} handler task(s) still running after {:?}; aborting",
                self.tasks.len(),
                grace
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

/// One project's handling cycle
struct ProjectTask {
    ctx: AppContext,
    services: RealmServices,
    limiter: Arc<Semaphore>,
    doc_id: String,
}

/// Document and cause a finished cycle left behind
struct Finished {
    doc: ProjectDocument,
    cause: Option<String>,
}

impl ProjectTask {
    async fn run(self) -> ProjectReport {
        let mut report = ProjectReport::new(&self.doc_id);

        let doc = match self.ctx.store.fetch_project(&self.doc_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                let err = OrchestratorError::ProjectNotFound(self.doc_id.clone());
                warn!("{}", err);
                report.cause = Some(err.to_string());
                return report;
            }
            Err(e) => {
                warn!("Cannot load project {}: {}", self.doc_id, e);
                report.cause = Some(e.to_string());
                return report;
            }
        };
        let doc = self.with_session(doc);
        report.status = Some(doc.status);

        if doc.status.is_terminal() {
            debug!("Project {} is already {}; nothing to do", self.doc_id, doc.status);
            self.record_handled(&doc).await;
            return report;
        }

        if doc.status == ProjectStatus::Unrecognized {
            let raw = doc.payload.get("status").map(|v| v.to_string()).unwrap_or_default();
            warn!("Project {} has unrecognized status {}; leaving it alone", self.doc_id, raw);
            report.cause = Some(format!("unrecognized status {}", raw));
            self.record_handled(&doc).await;
            return report;
        }

        let handler = match self.ctx.registry.resolve_project(&doc.library_prep_method) {
            Ok(resolved) => {
                debug!(
                    "Project {} resolved to '{}' ({} match on '{}')",
                    self.doc_id,
                    resolved.handler.name(),
                    resolved.kind,
                    resolved.key
                );
                resolved.handler
            }
            Err(e) => {
                warn!(
                    "No handler for project {} (library_prep_method '{}')",
                    self.doc_id, doc.library_prep_method
                );
                report.cause = Some(e.to_string());
                if let Some(doc) = self.mark_unresolved(&doc).await {
                    report.status = Some(doc.status);
                    self.record_handled(&doc).await;
                }
                return report;
            }
        };
        report.handler = Some(handler.name().to_string());

        let run_id = Uuid::new_v4();
        let span = project_span(&self.doc_id, handler.name());
        let result = AssertUnwindSafe(self.drive(handler.as_ref(), doc.clone()).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(OrchestratorError::handler(
                    handler.name(),
                    format!("panicked: {}", panic_message(&panic)),
                ))
            });

        match result {
            Ok(finished) => {
                debug!("Run {} for {} finished in {}", run_id, self.doc_id, finished.doc.status);
                report.status = Some(finished.doc.status);
                report.cause = finished.cause;
                self.record_handled(&finished.doc).await;
            }
            Err(OrchestratorError::Shutdown) => {
                info!(
                    "Project {} interrupted by shutdown; it resumes on restart",
                    self.doc_id
                );
                if let Ok(Some(current)) = self.ctx.store.fetch_project(&self.doc_id).await {
                    report.status = Some(current.status);
                }
                report.cause = Some(OrchestratorError::Shutdown.to_string());
            }
            Err(e) => {
                error!(
                    "Handler '{}' failed for project {} (run {}, {}): {}",
                    handler.name(),
                    self.doc_id,
                    run_id,
                    e.category(),
                    e
                );
                report.cause = Some(e.to_string());
                let manual = self.services.submission_mode(&doc, handler.as_ref())
                    == SubmissionMode::Manual;
                if let Some(doc) = self.contain_failure(&e, manual).await {
                    report.status = Some(doc.status);
                    self.record_handled(&doc).await;
                }
            }
        }

        self.ctx.job_monitor.release(&self.doc_id);
        report
    }

    async fn drive(&self, handler: &dyn RealmHandler, doc: ProjectDocument) -> Result<Finished> {
        let store = self.ctx.store.as_ref();
        let doc_id = self.doc_id.as_str();

        let mut outcome = match doc.status {
            ProjectStatus::AwaitingExternalJob => {
                info!("Resuming project {} in {}", doc_id, doc.status);
                Outcome::AwaitingJob(self.ctx.job_monitor.adopt(&doc).await?)
            }
            ProjectStatus::Finalizing => Outcome::Completed,
            _ => {
                if doc.status == ProjectStatus::Received {
                    // Transition: RECEIVED → QUEUED
                    persist_transition(store, doc_id, |sm| sm.queue()).await?;
                }

                let _permit = self.permit().await?;
                // Transition: QUEUED → PROCESSING
                let doc = persist_transition(store, doc_id, |sm| sm.start()).await?;
                let doc = self.with_session(doc);

                info!("Handling project {} with '{}'", doc_id, handler.name());
                handler.handle(&doc, &self.services).await?
            }
        };

        loop {
            outcome = match outcome {
                Outcome::AwaitingJob(handle) => {
                    let result = self.ctx.job_monitor.await_completion(handle).await?;
                    let doc = self.fetch_required().await?;

                    let _permit = self.permit().await?;
                    handler.on_job_finished(&doc, result, &self.services).await?
                }
                Outcome::Completed => {
                    if self.fetch_required().await?.status != ProjectStatus::Finalizing {
                        // Transition: PROCESSING | AWAITING_EXTERNAL_JOB → FINALIZING
                        persist_transition(store, doc_id, |sm| sm.finalize()).await?;
                    }
                    // Transition: FINALIZING → COMPLETED
                    let doc = persist_transition(store, doc_id, |sm| sm.complete()).await?;
                    info!("Project {} completed", doc_id);
                    return Ok(Finished { doc, cause: None });
                }
                Outcome::Failed(reason) => {
                    warn!("Project {} failed in '{}': {}", doc_id, handler.name(), reason);
                    // Transition: * → FAILED
                    let doc = persist_transition(store, doc_id, |sm| sm.fail()).await?;
                    return Ok(Finished {
                        doc,
                        cause: Some(reason),
                    });
                }
            };
        }
    }

    /// Handler slot, abandoned on shutdown
    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Err(OrchestratorError::Shutdown),
            permit = self.limiter.clone().acquire_owned() => {
                permit.map_err(|_| OrchestratorError::Shutdown)
            }
        }
    }

    fn with_session(&self, mut doc: ProjectDocument) -> ProjectDocument {
        doc.manual_submit = self.ctx.session.manual_submit;
        doc
    }

    async fn fetch_required(&self) -> Result<ProjectDocument> {
        let doc = self
            .ctx
            .store
            .fetch_project(&self.doc_id)
            .await?
            .ok_or_else(|| OrchestratorError::ProjectNotFound(self.doc_id.clone()))?;
        Ok(self.with_session(doc))
    }

    /// `Unhandled` from `Received`, otherwise `Failed`
    async fn mark_unresolved(&self, doc: &ProjectDocument) -> Option<ProjectDocument> {
        let unhandled = doc.status == ProjectStatus::Received;
        let result = persist_transition(self.ctx.store.as_ref(), &self.doc_id, |sm| {
            if unhandled {
                // Transition: RECEIVED → UNHANDLED
                sm.mark_unhandled()
            } else {
                sm.fail()
            }
        })
        .await;

        match result {
            Ok(doc) => Some(doc),
            Err(e) => {
                error!("Could not record missing handler for {}: {}", self.doc_id, e);
                None
            }
        }
    }

    /// Persist the status an error leaves behind
    ///
    /// A rejected submission in manual mode parks the project in
    /// `AwaitingExternalJob` for an operator; everything else is `Failed`.
    async fn contain_failure(&self, err: &OrchestratorError, manual: bool) -> Option<ProjectDocument> {
        let store = self.ctx.store.as_ref();

        if manual && matches!(err, OrchestratorError::JobSubmission(_)) {
            let parked = persist_transition(store, &self.doc_id, |sm| {
                if sm.status() == ProjectStatus::AwaitingExternalJob {
                    Ok(())
                } else {
                    sm.await_job(None)
                }
            })
            .await;
            match parked {
                Ok(doc) => {
                    warn!(
                        "Submission for {} failed in manual mode; waiting for an operator to record external_job_id",
                        self.doc_id
                    );
                    return Some(doc);
                }
                Err(e) => debug!("Cannot park {} for manual submission: {}", self.doc_id, e),
            }
        }

        match persist_transition(store, &self.doc_id, |sm| sm.fail()).await {
            Ok(doc) => Some(doc),
            Err(e) => {
                error!("Could not mark project {} failed: {}", self.doc_id, e);
                None
            }
        }
    }

    /// Remember the revision this cycle ended on
    async fn record_handled(&self, doc: &ProjectDocument) {
        let marked = update_status_record_with_retry(self.ctx.store.as_ref(), &doc.doc_id, |record| {
            record.mark_handled(doc.rev.clone(), doc.status);
            true
        })
        .await;
        if let Err(e) = marked {
            warn!("Cannot update status record for {}: {}", doc.doc_id, e);
        }
    }
}

async fn run_trigger(
    ctx: AppContext,
    limiter: Arc<Semaphore>,
    key: String,
    path: PathBuf,
) -> TaskReport {
    let handler = match ctx.registry.resolve_trigger(&key) {
        Ok(resolved) => resolved.handler,
        Err(e) => {
            warn!("No handler for trigger {} ({})", key, path.display());
            return TaskReport::Trigger {
                key,
                handler: None,
                result: Err(e.to_string()),
            };
        }
    };

    let services = ctx.services();
    let span = trigger_span(&key, handler.name());
    let run = trigger_outcome(&ctx, &limiter, handler.as_ref(), &services, &path);
    let result = AssertUnwindSafe(run.instrument(span))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(OrchestratorError::handler(
                handler.name(),
                format!("panicked: {}", panic_message(&panic)),
            ))
        });

    if let Err(e) = &result {
        error!("Trigger {} failed in '{}': {}", key, handler.name(), e);
    }
    TaskReport::Trigger {
        key,
        handler: Some(handler.name().to_string()),
        result: result.map_err(|e| e.to_string()),
    }
}

async fn trigger_outcome(
    ctx: &AppContext,
    limiter: &Semaphore,
    handler: &dyn RealmHandler,
    services: &RealmServices,
    path: &Path,
) -> Result<String> {
    let outcome = {
        let _permit = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Err(OrchestratorError::Shutdown),
            permit = limiter.acquire() => permit.map_err(|_| OrchestratorError::Shutdown)?,
        };
        handler.handle_trigger(path, services).await?
    };

    match outcome {
        Outcome::Completed => Ok("completed".to_string()),
        Outcome::AwaitingJob(handle) => {
            let result = ctx.job_monitor.await_completion(handle).await?;
            Ok(format!("job {}", result))
        }
        Outcome::Failed(reason) => Err(OrchestratorError::handler(handler.name(), reason)),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{base_config, SessionFlags};
    use crate::job_monitor::JobState;
    use crate::realm::FnRealm;
    use crate::registry::{HandlerRegistration, HandlerRegistry, KeySpace};
    use crate::testing::ScriptedScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yggdrasil_storage::{InMemoryStore, ProjectStore, StatusRecord};

    fn context(
        store: Arc<InMemoryStore>,
        scheduler: Arc<ScriptedScheduler>,
        registrations: Vec<HandlerRegistration>,
    ) -> AppContext {
        session_context(store, scheduler, registrations, SessionFlags::default())
    }

    fn session_context(
        store: Arc<InMemoryStore>,
        scheduler: Arc<ScriptedScheduler>,
        registrations: Vec<HandlerRegistration>,
        session: SessionFlags,
    ) -> AppContext {
        let mut builder = HandlerRegistry::builder();
        for registration in registrations {
            builder.register(registration, "test").unwrap();
        }
        let mut config = base_config(std::env::temp_dir().join("ygg-dispatcher-tests"));
        config.job_monitor_poll_interval = 0.01;
        AppContext::new(
            config,
            session,
            store,
            builder.build(),
            scheduler,
        )
    }

    fn completing(name: &str) -> Arc<dyn RealmHandler> {
        Arc::new(FnRealm::new(
            name.to_string(),
            |_doc: ProjectDocument, _services: RealmServices| async {
                Ok::<_, OrchestratorError>(Outcome::Completed)
            },
        ))
    }

    fn counting(name: &str, calls: Arc<AtomicUsize>) -> Arc<dyn RealmHandler> {
        Arc::new(FnRealm::new(
            name.to_string(),
            move |_doc: ProjectDocument, _services: RealmServices| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OrchestratorError>(Outcome::Completed) }
            },
        ))
    }

    fn project_report(report: TaskReport) -> ProjectReport {
        match report {
            TaskReport::Project(report) => report,
            other => panic!("Expected project report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completes_without_external_job() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "SmartSeq 3"));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("SmartSeq", true, completing("smartseq"))],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        assert_eq!(
            dispatcher.dispatch(Event::project("d1")).await,
            DispatchDecision::Spawned
        );
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert!(report.succeeded());
        assert_eq!(report.handler.as_deref(), Some("smartseq"));
        assert_eq!(report.to_string(), "doc d1: completed");
        assert!(!dispatcher.is_claimed("d1"));

        let record = store.fetch_status_record("d1").await.unwrap().unwrap();
        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(record.handled_rev, doc.rev);
        assert_eq!(record.last_status, Some(ProjectStatus::Completed));
    }

    #[tokio::test]
    async fn test_unresolved_marks_unhandled() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "Unknown Method"));
        let ctx = context(store.clone(), Arc::new(ScriptedScheduler::new()), vec![]);

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Unhandled));
        assert!(!report.succeeded());
        assert!(report.cause.unwrap().contains("Unknown Method"));
    }

    #[tokio::test]
    async fn test_handler_error_marks_failed() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m"));
        let failing: Arc<dyn RealmHandler> = Arc::new(FnRealm::new(
            "failing",
            |_doc: ProjectDocument, _services: RealmServices| async {
                Err::<Outcome, _>(OrchestratorError::handler("failing", "disk full"))
            },
        ));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("m", false, failing)],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Failed));
        assert!(report.cause.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m"));
        let panicking: Arc<dyn RealmHandler> = Arc::new(FnRealm::new(
            "panicking",
            |_doc: ProjectDocument, _services: RealmServices| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, OrchestratorError>(Outcome::Completed)
            },
        ));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("m", false, panicking)],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Failed));
        assert!(report.cause.unwrap().contains("boom"));
        assert!(!dispatcher.is_claimed("d1"));
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_project() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m"));
        let submitting: Arc<dyn RealmHandler> = Arc::new(FnRealm::new(
            "submitting",
            |doc: ProjectDocument, services: RealmServices| async move {
                let handle = services
                    .job_monitor()
                    .submit_or_adopt(&doc, Some(Path::new("/tmp/job.sh")), SubmissionMode::Automatic)
                    .await?;
                Ok::<_, OrchestratorError>(Outcome::AwaitingJob(handle))
            },
        ));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new().reject_submissions()),
            vec![HandlerRegistration::for_handler("m", false, submitting)],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Failed));
        assert!(report.cause.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_terminal_document_is_not_handled_again() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m").with_status(ProjectStatus::Completed));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("m", false, completing("m"))],
        );

        let saves = store.project_saves();
        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Completed));
        assert_eq!(report.handler, None);
        assert_eq!(store.project_saves(), saves);
    }

    #[tokio::test]
    async fn test_manual_submission_failure_parks_project() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m"));
        let unsubmittable: Arc<dyn RealmHandler> = Arc::new(FnRealm::new(
            "unsubmittable",
            |_doc: ProjectDocument, _services: RealmServices| async {
                Err::<Outcome, _>(OrchestratorError::JobSubmission("qsub unavailable".to_string()))
            },
        ));
        let ctx = session_context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("m", false, unsubmittable)],
            SessionFlags::new(false, true),
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::AwaitingExternalJob));
        assert!(report.cause.unwrap().contains("qsub unavailable"));

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(doc.status, ProjectStatus::AwaitingExternalJob);
        assert!(doc.external_job_id.is_none());
        let record = store.fetch_status_record("d1").await.unwrap().unwrap();
        assert_eq!(record.last_status, Some(ProjectStatus::AwaitingExternalJob));
    }

    #[tokio::test]
    async fn test_pascal_case_completed_is_not_rerun() {
        let store = Arc::new(InMemoryStore::new());
        let raw = serde_json::json!({
            "_id": "d1",
            "library_prep_method": "10X Chromium",
            "status": "Completed",
        });
        store.seed(ProjectDocument::from_json(raw).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("10X", true, counting("tenx", calls.clone()))],
        );

        let saves = store.project_saves();
        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.project_saves(), saves);
    }

    #[tokio::test]
    async fn test_unrecognized_status_is_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let raw = serde_json::json!({
            "_id": "d1",
            "library_prep_method": "10X Chromium",
            "status": "on_hold",
        });
        let rev = store.seed(ProjectDocument::from_json(raw).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("10X", true, counting("tenx", calls.clone()))],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert_eq!(report.status, Some(ProjectStatus::Unrecognized));
        assert!(report.cause.unwrap().contains("on_hold"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let stored = store.raw_project("d1").unwrap();
        assert_eq!(stored["status"], "on_hold");
        assert_eq!(stored["_rev"], rev.as_str());
        let record = store.fetch_status_record("d1").await.unwrap().unwrap();
        assert_eq!(record.handled_rev.as_deref(), Some(rev.as_str()));
    }

    #[tokio::test]
    async fn test_handled_mark_survives_concurrent_record_write() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(ProjectDocument::new("d1", "m"));
        let mut seen = StatusRecord::new("d1");
        seen.last_seq = Some("1".to_string());
        store.save_status_record(&seen).await.unwrap();

        let ctx = context(
            store.clone(),
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("m", false, completing("m"))],
        );
        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.dispatch(Event::project("d1")).await;
        assert!(project_report(dispatcher.join_next().await.unwrap()).succeeded());

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let record = store.fetch_status_record("d1").await.unwrap().unwrap();
        assert_eq!(record.handled_rev, doc.rev);
        assert_eq!(record.last_seq.as_deref(), Some("1"));

        // A writer still holding the first copy must not erase the mark
        seen.rev = Some("1-mem".to_string());
        seen.last_seq = Some("9".to_string());
        assert!(store.save_status_record(&seen).await.is_err());
        let record = store.fetch_status_record("d1").await.unwrap().unwrap();
        assert_eq!(record.handled_rev, doc.rev);
    }

    #[tokio::test]
    async fn test_trigger_waiting_for_slot_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store, Arc::new(ScriptedScheduler::new()), vec![]);
        let services = ctx.services();
        let handler = completing("seq");
        let saturated = Semaphore::new(0);
        ctx.shutdown.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            trigger_outcome(&ctx, &saturated, handler.as_ref(), &services, Path::new("/data/seq/done")),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(OrchestratorError::Shutdown)));
    }

    #[tokio::test]
    async fn test_adopts_recorded_job_on_resume() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(
            ProjectDocument::new("d1", "m")
                .with_status(ProjectStatus::AwaitingExternalJob)
                .with_external_job_id("777"),
        );
        let scheduler = Arc::new(
            ScriptedScheduler::new().with_states(vec![Ok(JobState::Running), Ok(JobState::Succeeded)]),
        );
        let ctx = context(
            store.clone(),
            scheduler.clone(),
            vec![HandlerRegistration::for_handler("m", false, completing("m"))],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        assert_eq!(
            dispatcher.dispatch(Event::ExternalSignal(Signal::Rescan)).await,
            DispatchDecision::Rescanned(1)
        );
        let report = project_report(dispatcher.join_next().await.unwrap());

        assert!(report.succeeded());
        assert_eq!(scheduler.submissions(), 0);
        assert_eq!(scheduler.status_polls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_trigger_reports_error() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(
            store,
            Arc::new(ScriptedScheduler::new()),
            vec![HandlerRegistration::for_handler("seq/", true, completing("seq"))
                .in_keyspace(KeySpace::Trigger)],
        );

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher
            .dispatch(Event::FileTrigger {
                key: "other/run1/done".to_string(),
                path: PathBuf::from("/data/other/run1/done"),
            })
            .await;
        match dispatcher.join_next().await.unwrap() {
            TaskReport::Trigger { result, handler, .. } => {
                assert!(result.is_err());
                assert!(handler.is_none());
            }
            other => panic!("Expected trigger report, got {:?}", other),
        }

        dispatcher
            .dispatch(Event::FileTrigger {
                key: "seq/run1/done".to_string(),
                path: PathBuf::from("/data/seq/run1/done"),
            })
            .await;
        match dispatcher.join_next().await.unwrap() {
            TaskReport::Trigger { result, .. } => {
                // FnRealm does not override handle_trigger
                assert!(result.unwrap_err().contains("does not handle trigger files"));
            }
            other => panic!("Expected trigger report, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_run() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store, Arc::new(ScriptedScheduler::new()), vec![]);
        let token = ctx.shutdown.clone();
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(Dispatcher::new(ctx).run(rx));
        tx.send(Event::ExternalSignal(Signal::Shutdown)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
