use crate::error::{OrchestratorError, Result};
use yggdrasil_storage::{update_project_with_retry, ProjectDocument, ProjectStatus, ProjectStore};

/// Whether `from → to` is a legal lifecycle step
///
/// `Processing → Processing` and `AwaitingExternalJob → AwaitingExternalJob`
/// are allowed so a crashed run can resume in place and a job id can be
/// recorded for a manual-submission wait. A document whose status is not
/// recognized never moves.
pub fn can_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
    use ProjectStatus::*;

    if from.is_terminal() || from == Unrecognized {
        return false;
    }

    match to {
        Failed => true,
        Unhandled => from == Received,
        Queued => from == Received,
        Processing => matches!(from, Queued | Processing),
        AwaitingExternalJob => matches!(from, Processing | AwaitingExternalJob),
        Finalizing => matches!(from, Processing | AwaitingExternalJob),
        Completed => from == Finalizing,
        Received | Unrecognized => false,
    }
}

/// Project state machine for transitions
///
/// Operates on a working copy; nothing is durable until the document is saved
/// (see [`persist_transition`]).
pub struct ProjectStateMachine {
    doc: ProjectDocument,
}

impl ProjectStateMachine {
    pub fn new(doc: ProjectDocument) -> Self {
        Self { doc }
    }

    pub fn document(&self) -> &ProjectDocument {
        &self.doc
    }

    pub fn into_document(self) -> ProjectDocument {
        self.doc
    }

    pub fn status(&self) -> ProjectStatus {
        self.doc.status
    }

    fn transition(&mut self, to: ProjectStatus) -> Result<()> {
        if !can_transition(self.doc.status, to) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.doc.status.to_string(),
                to: to.to_string(),
            });
        }
        self.doc.status = to;
        Ok(())
    }

    /// Transition: RECEIVED → QUEUED
    pub fn queue(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Queued)
    }

    /// Transition: QUEUED → PROCESSING (or resume PROCESSING)
    pub fn start(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Processing)
    }

    /// Transition: PROCESSING → AWAITING_EXTERNAL_JOB
    ///
    /// Records `job_id` when given. A recorded id is never replaced by a
    /// different one.
    pub fn await_job(&mut self, job_id: Option<String>) -> Result<()> {
        if let (Some(existing), Some(new)) = (&self.doc.external_job_id, &job_id) {
            if existing != new {
                return Err(OrchestratorError::InvalidStateTransition {
                    from: format!("{} (job {})", self.doc.status, existing),
                    to: format!("{} (job {})", ProjectStatus::AwaitingExternalJob, new),
                });
            }
        }

        self.transition(ProjectStatus::AwaitingExternalJob)?;
        if job_id.is_some() {
            self.doc.external_job_id = job_id;
        }
        Ok(())
    }

    /// Transition: PROCESSING | AWAITING_EXTERNAL_JOB → FINALIZING
    pub fn finalize(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Finalizing)
    }

    /// Transition: FINALIZING → COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Completed)
    }

    /// Transition: * → FAILED
    pub fn fail(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Failed)
    }

    /// Transition: RECEIVED → UNHANDLED
    pub fn mark_unhandled(&mut self) -> Result<()> {
        self.transition(ProjectStatus::Unhandled)
    }
}

/// Apply `step` to the current stored document and persist it
///
/// Re-reads and retries on revision conflicts. A step that rejects the
/// transition aborts without writing.
pub async fn persist_transition<F>(
    store: &dyn ProjectStore,
    doc_id: &str,
    mut step: F,
) -> Result<ProjectDocument>
where
    F: FnMut(&mut ProjectStateMachine) -> Result<()> + Send,
{
    update_project_with_retry(store, doc_id, |doc| {
        let mut sm = ProjectStateMachine::new(doc.clone());
        step(&mut sm)?;
        *doc = sm.into_document();
        Ok::<(), OrchestratorError>(())
    })
    .await
}
