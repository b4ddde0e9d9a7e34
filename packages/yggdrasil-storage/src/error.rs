//! Error types for yggdrasil-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store unreachable (refused connection, timeout, DNS)
    Connection,
    /// Write rejected because the document revision is stale
    Conflict,
    /// Document or database not found
    NotFound,
    /// Serialization/deserialization errors
    Serialization,
    /// Unexpected HTTP status from the store
    Http,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Http => "http",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status reported by the store, if any
    pub status: Option<u16>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            status: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    // Convenience constructors
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Conflict,
            format!("Document update conflict: {}", doc_id.into()),
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, format!("Not found: {}", what.into()))
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Http, message).with_status(status)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Transient failures are retried on the next poll tick.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Connection => true,
            ErrorKind::Http => matches!(self.status, Some(s) if s >= 500),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

#[cfg(feature = "couchdb")]
impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            StorageError::connection(format!("CouchDB unreachable: {}", err)).with_source(err)
        } else if err.is_decode() {
            StorageError::serialization(format!("Malformed CouchDB response: {}", err))
                .with_source(err)
        } else {
            let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
            StorageError::http(status, format!("CouchDB request failed: {}", err)).with_source(err)
        }
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
