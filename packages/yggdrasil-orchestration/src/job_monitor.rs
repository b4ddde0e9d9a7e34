//! External batch job tracking
//!
//! The monitor owns at most one [`JobHandle`] per project. A handle's durable
//! anchor is `ProjectDocument.external_job_id`: whenever that id is present the
//! job is adopted, never resubmitted.
//!
//! ```text
//! submit_or_adopt(doc)
//!   ├─ external_job_id set   → adopt (no scheduler call)
//!   ├─ manual submission     → AwaitingExternalJob, WaitingForExternalId
//!   └─ automatic             → sbatch → persist id → Submitted
//! await_completion(handle)   → poll every job_monitor_poll_interval
//! ```
//!
//! The manual wait has no timeout; the id is re-read from the document on the
//! normal poll cadence until an operator records it.

use crate::error::{OrchestratorError, Result};
use crate::project::persist_transition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yggdrasil_storage::{ProjectDocument, ProjectStatus, ProjectStore};

/// Terminal result of an external job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobResult {
    Succeeded,
    Failed,
    Cancelled,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Succeeded => "succeeded",
            JobResult::Failed => "failed",
            JobResult::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last known state of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Manual submission: no job id recorded yet
    WaitingForExternalId,
    /// Job id known, no status observed yet
    Submitted,
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::WaitingForExternalId => "waiting_for_external_id",
            JobState::Submitted => "submitted",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn result(&self) -> Option<JobResult> {
        match self {
            JobState::Succeeded => Some(JobResult::Succeeded),
            JobState::Failed => Some(JobResult::Failed),
            JobState::Cancelled => Some(JobResult::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.result().is_some()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One project's HPC phase
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub doc_id: String,
    pub job_id: Option<String>,
    pub last_known_state: JobState,
    pub started_at: DateTime<Utc>,
    /// Bound to a job id that was already recorded on the document
    pub adopted: bool,
}

impl JobHandle {
    fn new(doc_id: &str, job_id: Option<String>, adopted: bool) -> Self {
        let last_known_state = if job_id.is_some() {
            JobState::Submitted
        } else {
            JobState::WaitingForExternalId
        };
        Self {
            doc_id: doc_id.to_string(),
            job_id,
            last_known_state,
            started_at: Utc::now(),
            adopted,
        }
    }
}

/// How a job reaches the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    Automatic,
    /// An operator submits out of band and records the id on the document
    Manual,
}

/// Batch scheduler port
#[async_trait]
pub trait JobScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a batch script, returning the scheduler's job id
    async fn submit(&self, script: &Path) -> Result<String>;

    /// Current state of a submitted job
    async fn status(&self, job_id: &str) -> Result<JobState>;
}

/// Tracks external jobs for in-flight projects
pub struct JobMonitor {
    store: Arc<dyn ProjectStore>,
    scheduler: Arc<dyn JobScheduler>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    active: DashMap<String, JobHandle>,
}

impl JobMonitor {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        scheduler: Arc<dyn JobScheduler>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            scheduler,
            poll_interval,
            shutdown,
            active: DashMap::new(),
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    /// Bind a job to `doc`, submitting only when no id is recorded
    ///
    /// `script` is required for automatic submission only.
    pub async fn submit_or_adopt(
        &self,
        doc: &ProjectDocument,
        script: Option<&Path>,
        mode: SubmissionMode,
    ) -> Result<JobHandle> {
        self.claim(&doc.doc_id)?;

        let result = self.bind(doc, script, mode).await;
        match &result {
            Ok(handle) => {
                self.active.insert(doc.doc_id.clone(), handle.clone());
            }
            Err(_) => self.release(&doc.doc_id),
        }
        result
    }

    /// Re-attach to whatever the document records (recovery path)
    pub async fn adopt(&self, doc: &ProjectDocument) -> Result<JobHandle> {
        self.submit_or_adopt(doc, None, SubmissionMode::Manual).await
    }

    fn claim(&self, doc_id: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.active.entry(doc_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::JobSubmission(format!(
                "project {} already has an active job handle",
                doc_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(JobHandle::new(doc_id, None, false));
                Ok(())
            }
        }
    }

    async fn bind(
        &self,
        doc: &ProjectDocument,
        script: Option<&Path>,
        mode: SubmissionMode,
    ) -> Result<JobHandle> {
        let doc_id = doc.doc_id.as_str();

        if let Some(job_id) = &doc.external_job_id {
            info!("Adopting job {} for {}", job_id, doc_id);
            if doc.status != ProjectStatus::AwaitingExternalJob {
                let id = job_id.clone();
                persist_transition(self.store.as_ref(), doc_id, |sm| {
                    sm.await_job(Some(id.clone()))
                })
                .await?;
            }
            return Ok(JobHandle::new(doc_id, Some(job_id.clone()), true));
        }

        match mode {
            SubmissionMode::Manual => {
                if doc.status != ProjectStatus::AwaitingExternalJob {
                    persist_transition(self.store.as_ref(), doc_id, |sm| sm.await_job(None))
                        .await?;
                }
                info!(
                    "{} is waiting for a manually submitted job id (external_job_id)",
                    doc_id
                );
                Ok(JobHandle::new(doc_id, None, false))
            }
            SubmissionMode::Automatic => {
                let script = script.ok_or_else(|| {
                    OrchestratorError::JobSubmission(format!(
                        "no batch script to submit for {}",
                        doc_id
                    ))
                })?;

                let job_id = self.scheduler.submit(script).await?;
                info!(
                    "Submitted {} to {} as job {}",
                    script.display(),
                    self.scheduler.name(),
                    job_id
                );

                // Durable before any waiting starts
                let id = job_id.clone();
                if let Err(e) = persist_transition(self.store.as_ref(), doc_id, |sm| {
                    sm.await_job(Some(id.clone()))
                })
                .await
                {
                    error!(
                        "Job {} was submitted for {} but its id could not be recorded: {}",
                        job_id, doc_id, e
                    );
                    return Err(e);
                }

                Ok(JobHandle::new(doc_id, Some(job_id), false))
            }
        }
    }

    /// Poll until the job reaches a terminal state
    ///
    /// Poll failures keep the handle and retry on the next tick. Shutdown
    /// returns `OrchestratorError::Shutdown` and leaves the document in
    /// `AwaitingExternalJob` for adoption on restart.
    pub async fn await_completion(&self, mut handle: JobHandle) -> Result<JobResult> {
        let doc_id = handle.doc_id.clone();
        let result = loop {
            match &handle.job_id {
                None => match self.store.fetch_project(&doc_id).await {
                    Ok(Some(doc)) => {
                        if let Some(job_id) = doc.external_job_id {
                            info!("Picked up job id {} for {}", job_id, doc_id);
                            handle.job_id = Some(job_id);
                            handle.last_known_state = JobState::Submitted;
                            self.active.insert(doc_id.clone(), handle.clone());
                            continue;
                        }
                    }
                    Ok(None) => break Err(OrchestratorError::ProjectNotFound(doc_id.clone())),
                    Err(e) => warn!("Re-reading {} for a job id failed: {}", doc_id, e),
                },
                Some(job_id) => match self.scheduler.status(job_id).await {
                    Ok(state) => {
                        if state != handle.last_known_state {
                            debug!("Job {} for {}: {} -> {}", job_id, doc_id, handle.last_known_state, state);
                            handle.last_known_state = state;
                            self.active.insert(doc_id.clone(), handle.clone());
                        }
                        if let Some(result) = state.result() {
                            info!("Job {} for {} finished: {}", job_id, doc_id, result);
                            break Ok(result);
                        }
                    }
                    Err(e) => warn!("Status poll for job {} ({}) failed, retrying: {}", job_id, doc_id, e),
                },
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break Err(OrchestratorError::Shutdown),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        self.release(&doc_id);
        result
    }

    pub fn active_handle(&self, doc_id: &str) -> Option<JobHandle> {
        self.active.get(doc_id).map(|h| h.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop the handle for `doc_id`, if any
    pub fn release(&self, doc_id: &str) {
        self.active.remove(doc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedScheduler;
    use yggdrasil_storage::InMemoryStore;

    fn monitor(
        store: Arc<InMemoryStore>,
        scheduler: Arc<ScriptedScheduler>,
    ) -> JobMonitor {
        JobMonitor::new(
            store,
            scheduler,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
    }

    fn processing(doc_id: &str) -> ProjectDocument {
        ProjectDocument::new(doc_id, "10X Chromium").with_status(ProjectStatus::Processing)
    }

    #[tokio::test]
    async fn test_automatic_submission_records_id_before_waiting() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(processing("d1"));
        let scheduler = Arc::new(ScriptedScheduler::new());
        let monitor = monitor(store.clone(), scheduler.clone());

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let handle = monitor
            .submit_or_adopt(&doc, Some(Path::new("/tmp/d1.sh")), SubmissionMode::Automatic)
            .await
            .unwrap();

        assert_eq!(scheduler.submissions(), 1);
        assert_eq!(handle.job_id.as_deref(), Some("1001"));
        assert!(!handle.adopted);

        let stored = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::AwaitingExternalJob);
        assert_eq!(stored.external_job_id.as_deref(), Some("1001"));
        assert!(monitor.active_handle("d1").is_some());
    }

    #[tokio::test]
    async fn test_recorded_id_is_adopted_for_any_mode() {
        for mode in [SubmissionMode::Automatic, SubmissionMode::Manual] {
            let store = Arc::new(InMemoryStore::new());
            store.seed(
                ProjectDocument::new("d1", "m")
                    .with_status(ProjectStatus::AwaitingExternalJob)
                    .with_external_job_id("555"),
            );
            let scheduler = Arc::new(ScriptedScheduler::new());
            let monitor = monitor(store.clone(), scheduler.clone());

            let doc = store.fetch_project("d1").await.unwrap().unwrap();
            let handle = monitor
                .submit_or_adopt(&doc, Some(Path::new("/tmp/d1.sh")), mode)
                .await
                .unwrap();

            assert_eq!(scheduler.submissions(), 0);
            assert!(handle.adopted);
            assert_eq!(handle.job_id.as_deref(), Some("555"));
            // Already awaiting: adoption writes nothing
            assert_eq!(store.project_saves(), 0);
        }
    }

    #[tokio::test]
    async fn test_second_handle_for_same_doc_rejected() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(processing("d1"));
        let scheduler = Arc::new(ScriptedScheduler::new());
        let monitor = monitor(store.clone(), scheduler.clone());

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        monitor
            .submit_or_adopt(&doc, Some(Path::new("/tmp/d1.sh")), SubmissionMode::Automatic)
            .await
            .unwrap();

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let second = monitor.adopt(&doc).await;
        assert!(matches!(second, Err(OrchestratorError::JobSubmission(_))));
        assert_eq!(scheduler.submissions(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_releases_claim() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(processing("d1"));
        let scheduler = Arc::new(ScriptedScheduler::new().reject_submissions());
        let monitor = monitor(store.clone(), scheduler.clone());

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let result = monitor
            .submit_or_adopt(&doc, Some(Path::new("/tmp/d1.sh")), SubmissionMode::Automatic)
            .await;

        assert!(matches!(result, Err(OrchestratorError::JobSubmission(_))));
        assert_eq!(monitor.active_count(), 0);
        let stored = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::Processing);
    }

    #[tokio::test]
    async fn test_await_completion_retries_poll_errors() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(processing("d1"));
        let scheduler = Arc::new(ScriptedScheduler::new().with_states(vec![
            Err("sacct unavailable".to_string()),
            Ok(JobState::Pending),
            Err("sacct unavailable".to_string()),
            Ok(JobState::Running),
            Ok(JobState::Succeeded),
        ]));
        let monitor = monitor(store.clone(), scheduler.clone());

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let handle = monitor
            .submit_or_adopt(&doc, Some(Path::new("/tmp/d1.sh")), SubmissionMode::Automatic)
            .await
            .unwrap();

        let result = monitor.await_completion(handle).await.unwrap();
        assert_eq!(result, JobResult::Succeeded);
        assert_eq!(scheduler.status_polls(), 5);
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_wait_picks_up_operator_id() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(processing("d1"));
        let scheduler = Arc::new(ScriptedScheduler::new());
        let monitor = Arc::new(monitor(store.clone(), scheduler.clone()));

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let handle = monitor
            .submit_or_adopt(&doc, None, SubmissionMode::Manual)
            .await
            .unwrap();
        assert_eq!(handle.last_known_state, JobState::WaitingForExternalId);

        let stored = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::AwaitingExternalJob);
        assert!(stored.external_job_id.is_none());

        let waiter = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.await_completion(handle).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Operator records the id out of band
        store.seed(stored.with_external_job_id("9001"));

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, JobResult::Succeeded);
        assert_eq!(scheduler.submissions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(
            ProjectDocument::new("d1", "m")
                .with_status(ProjectStatus::AwaitingExternalJob)
                .with_external_job_id("42"),
        );
        let scheduler =
            Arc::new(ScriptedScheduler::new().with_states(vec![Ok(JobState::Running); 1000]));
        let token = CancellationToken::new();
        let monitor = JobMonitor::new(
            store.clone(),
            scheduler,
            Duration::from_millis(10),
            token.clone(),
        );

        let doc = store.fetch_project("d1").await.unwrap().unwrap();
        let handle = monitor.adopt(&doc).await.unwrap();
        token.cancel();

        let result = monitor.await_completion(handle).await;
        assert!(matches!(result, Err(OrchestratorError::Shutdown)));

        let stored = store.fetch_project("d1").await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::AwaitingExternalJob);
    }

    #[test]
    fn test_job_state_results() {
        assert_eq!(JobState::Succeeded.result(), Some(JobResult::Succeeded));
        assert_eq!(JobState::Cancelled.result(), Some(JobResult::Cancelled));
        assert!(JobState::Running.result().is_none());
        assert!(!JobState::WaitingForExternalId.is_terminal());
    }
}
