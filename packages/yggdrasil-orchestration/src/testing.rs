//! Test doubles for embedders and integration tests

use crate::error::{OrchestratorError, Result};
use crate::job_monitor::{JobScheduler, JobState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Scheduler that plays back scripted status answers
///
/// Job ids count up from 1001. Once the script is exhausted every status
/// query answers `Succeeded`.
pub struct ScriptedScheduler {
    states: Mutex<VecDeque<std::result::Result<JobState, String>>>,
    submitted: Mutex<Vec<PathBuf>>,
    submissions: AtomicUsize,
    status_polls: AtomicUsize,
    reject: bool,
}

impl Default for ScriptedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedScheduler {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
            status_polls: AtomicUsize::new(0),
            reject: false,
        }
    }

    /// Status answers, in order; `Err` simulates a failed poll
    pub fn with_states(self, states: Vec<std::result::Result<JobState, String>>) -> Self {
        *self.states.lock() = states.into();
        self
    }

    /// Make every submission fail
    pub fn reject_submissions(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn submitted_scripts(&self) -> Vec<PathBuf> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl JobScheduler for ScriptedScheduler {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, script: &Path) -> Result<String> {
        if self.reject {
            return Err(OrchestratorError::JobSubmission(format!(
                "scheduler rejected {}",
                script.display()
            )));
        }
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().push(script.to_path_buf());
        Ok((1001 + n).to_string())
    }

    async fn status(&self, job_id: &str) -> Result<JobState> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        match self.states.lock().pop_front() {
            Some(Ok(state)) => Ok(state),
            Some(Err(message)) => Err(OrchestratorError::JobStatus(format!(
                "job {}: {}",
                job_id, message
            ))),
            None => Ok(JobState::Succeeded),
        }
    }
}
