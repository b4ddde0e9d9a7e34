use thiserror::Error;
use yggdrasil_storage::StorageError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No handler registered for key '{key}'")]
    Resolution { key: String },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerExecution { handler: String, message: String },

    #[error("Job submission failed: {0}")]
    JobSubmission(String),

    #[error("Job status query failed: {0}")]
    JobStatus(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn handler(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::HandlerExecution {
            handler: handler.into(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Storage(e) if e.is_transient() || e.is_conflict() => {
                ErrorCategory::Transient
            }
            OrchestratorError::Storage(_) => ErrorCategory::Infrastructure,
            OrchestratorError::JobStatus(_) | OrchestratorError::Timeout(_) => {
                ErrorCategory::Transient
            }
            OrchestratorError::Io(_) | OrchestratorError::Shutdown => ErrorCategory::Infrastructure,
            OrchestratorError::Config(_)
            | OrchestratorError::Resolution { .. }
            | OrchestratorError::HandlerExecution { .. }
            | OrchestratorError::JobSubmission(_)
            | OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::ProjectNotFound(_)
            | OrchestratorError::Parse(_)
            | OrchestratorError::Other(_) => ErrorCategory::Permanent,
        }
    }

    /// Store hiccups that the next poll tick will retry
    pub fn is_transient_io(&self) -> bool {
        matches!(self, OrchestratorError::Storage(e) if e.is_transient())
    }

    /// Only configuration errors are allowed to stop the daemon
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Config(_))
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retried on the next poll tick (store hiccup, status poll)
    Transient,
    /// Permanent error - project is marked failed (handler error, bad document)
    Permanent,
    /// Infrastructure error - alert ops (disk, shutdown)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
