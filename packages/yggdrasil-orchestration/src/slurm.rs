//! Slurm adapter for the `JobScheduler` port
//!
//! - submit: `sbatch <script>`; the job id is the first integer on stdout
//! - status: `sacct -n -X -o State -j <id>`; first non-empty line
//!
//! Both invocations are bounded by the configured command timeout.

use crate::config::SlurmConfig;
use crate::error::{OrchestratorError, Result};
use crate::job_monitor::{JobScheduler, JobState};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
    command_timeout: Duration,
}

impl SlurmScheduler {
    pub fn new(config: &SlurmConfig) -> Self {
        Self {
            sbatch: config.sbatch.clone(),
            sacct: config.sacct.clone(),
            command_timeout: Duration::from_secs_f64(config.command_timeout),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!("Running {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "{} did not finish within {:?}",
                program, self.command_timeout
            ))),
        }
    }
}

/// First run of ASCII digits in `stdout`
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let start = stdout.find(|c: char| c.is_ascii_digit())?;
    let digits: String = stdout[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some(digits)
}

/// Map `sacct` State output to a job state
///
/// `sacct` truncates long names with `+` (`CANCELLED+`, `OUT_OF_ME+`) and may
/// append detail (`CANCELLED by 1234`). An empty answer means the job is not
/// in the accounting database yet.
pub fn parse_state(stdout: &str) -> JobState {
    let state = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or("")
        .trim_end_matches('+');

    match state {
        "COMPLETED" => JobState::Succeeded,
        s if s.starts_with("CANCELLED") => JobState::Cancelled,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED" => {
            JobState::Failed
        }
        s if s.starts_with("OUT_OF_ME") => JobState::Failed,
        "" | "PENDING" | "REQUEUED" | "RESV_DEL_HOLD" => JobState::Pending,
        _ => JobState::Running,
    }
}

#[async_trait]
impl JobScheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, script: &Path) -> Result<String> {
        let script_arg = script.to_string_lossy();
        let output = self
            .run(&self.sbatch, &[script_arg.as_ref()])
            .await
            .map_err(|e| OrchestratorError::JobSubmission(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::JobSubmission(format!(
                "{} exited with {}: {}",
                self.sbatch,
                output.status,
                stderr.trim()
            )));
        }

        parse_job_id(&stdout).ok_or_else(|| {
            OrchestratorError::JobSubmission(format!(
                "no job id in {} output: {}",
                self.sbatch,
                stdout.trim()
            ))
        })
    }

    async fn status(&self, job_id: &str) -> Result<JobState> {
        let output = self
            .run(&self.sacct, &["-n", "-X", "-o", "State", "-j", job_id])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::JobStatus(format!(
                "{} exited with {}: {}",
                self.sacct,
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id("Submitted batch job 123456\n").as_deref(),
            Some("123456")
        );
        assert_eq!(parse_job_id("98765;cluster").as_deref(), Some("98765"));
        assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn test_parse_state_terminal() {
        assert_eq!(parse_state("  COMPLETED \n"), JobState::Succeeded);
        assert_eq!(parse_state("CANCELLED+\n"), JobState::Cancelled);
        assert_eq!(parse_state("CANCELLED by 1234\n"), JobState::Cancelled);
        assert_eq!(parse_state("FAILED\n"), JobState::Failed);
        assert_eq!(parse_state("TIMEOUT\n"), JobState::Failed);
        assert_eq!(parse_state("OUT_OF_ME+\n"), JobState::Failed);
        assert_eq!(parse_state("OUT_OF_MEMORY\n"), JobState::Failed);
        assert_eq!(parse_state("NODE_FAIL\n"), JobState::Failed);
    }

    #[test]
    fn test_parse_state_active() {
        assert_eq!(parse_state(""), JobState::Pending);
        assert_eq!(parse_state("\n   \n"), JobState::Pending);
        assert_eq!(parse_state("PENDING\n"), JobState::Pending);
        assert_eq!(parse_state("RUNNING\n"), JobState::Running);
        assert_eq!(parse_state("COMPLETING\n"), JobState::Running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_with_stub_command() {
        let config = SlurmConfig {
            sbatch: "echo".to_string(),
            sacct: "true".to_string(),
            command_timeout: 5.0,
        };
        let scheduler = SlurmScheduler::new(&config);

        // `echo <script>` prints no digits for this path
        let err = scheduler
            .submit(Path::new("/tmp/job.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobSubmission(_)));

        let id = scheduler.submit(Path::new("/tmp/4242.sh")).await.unwrap();
        assert_eq!(id, "4242");

        // `true` prints nothing: not yet in accounting
        assert_eq!(scheduler.status("4242").await.unwrap(), JobState::Pending);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let config = SlurmConfig {
            sbatch: "sleep".to_string(),
            sacct: "true".to_string(),
            command_timeout: 0.2,
        };
        let scheduler = SlurmScheduler::new(&config);

        // `sleep 5` outlives the timeout
        let err = scheduler.submit(Path::new("5")).await.unwrap_err();
        match err {
            OrchestratorError::JobSubmission(message) => assert!(message.contains("did not finish")),
            other => panic!("Expected JobSubmission, got {:?}", other),
        }
    }
}
