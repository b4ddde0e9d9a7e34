//! Domain layer for the project state store
//!
//! # Domain Models
//!
//! - `ProjectDocument`: one unit of work, owned by the project database
//! - `ProjectStatus`: lifecycle status persisted on the project document
//! - `StatusRecord`: per-project tracking entry in the status-tracking database
//! - `Change` / `ChangeBatch`: one page of the change feed
//!
//! # Port Trait
//!
//! - `ProjectStore`: the only path through which documents are read and written
//!
//! Writes use optimistic concurrency: a save carrying a stale `_rev` is rejected
//! with `ErrorKind::Conflict` and must be retried by re-reading the document
//! (see `update_project_with_retry`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{Result, StorageError};

/// Reserved id of the change-feed cursor inside the status-tracking database
pub const CURSOR_DOC_ID: &str = "ygg_change_cursor";

/// Attempts made by `update_project_with_retry` before giving up on conflicts
pub const MAX_CONFLICT_RETRIES: usize = 5;

const STATUS_FIELD: &str = "status";
const JOB_ID_FIELD: &str = "external_job_id";
const METHOD_FIELD: &str = "library_prep_method";

// ═══════════════════════════════════════════════════════════════════════════
// Project Status
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a project document
///
/// ```text
/// Received → Queued → Processing → AwaitingExternalJob → Finalizing → Completed
///     │                    └──────────────────────────────────┘
///     └→ Unhandled                  (any non-terminal) → Failed
/// ```
///
/// `Unrecognized` stands for a stored status this build cannot read. It is
/// neither in flight nor terminal, and no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Received,
    Queued,
    Processing,
    AwaitingExternalJob,
    Finalizing,
    Completed,
    Failed,
    Unhandled,
    Unrecognized,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Received => "received",
            ProjectStatus::Queued => "queued",
            ProjectStatus::Processing => "processing",
            ProjectStatus::AwaitingExternalJob => "awaiting_external_job",
            ProjectStatus::Finalizing => "finalizing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Unhandled => "unhandled",
            ProjectStatus::Unrecognized => "unrecognized",
        }
    }

    /// Read a stored status
    ///
    /// Case and separators are ignored, so `awaiting_external_job`,
    /// `AwaitingExternalJob` and `Awaiting External Job` are the same status.
    pub fn parse(s: &str) -> Option<Self> {
        let wanted: String = s
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Self::KNOWN
            .iter()
            .copied()
            .find(|status| status.as_str().replace('_', "") == wanted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Unhandled
        )
    }

    /// Statuses a crashed process may have left behind mid-pipeline
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Queued
                | ProjectStatus::Processing
                | ProjectStatus::AwaitingExternalJob
                | ProjectStatus::Finalizing
        )
    }

    /// Every status the store may hold
    pub const KNOWN: [ProjectStatus; 8] = [
        ProjectStatus::Received,
        ProjectStatus::Queued,
        ProjectStatus::Processing,
        ProjectStatus::AwaitingExternalJob,
        ProjectStatus::Finalizing,
        ProjectStatus::Completed,
        ProjectStatus::Failed,
        ProjectStatus::Unhandled,
    ];

    pub const IN_FLIGHT: [ProjectStatus; 4] = [
        ProjectStatus::Queued,
        ProjectStatus::Processing,
        ProjectStatus::AwaitingExternalJob,
        ProjectStatus::Finalizing,
    ];
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Project Document
// ═══════════════════════════════════════════════════════════════════════════

/// Working copy of a project document
///
/// Only `status` and `external_job_id` are ever written back by the core;
/// every other field is kept verbatim in `payload` and round-trips untouched.
///
/// # Examples
///
/// ```rust
/// use yggdrasil_storage::domain::{ProjectDocument, ProjectStatus};
///
/// let doc = ProjectDocument::new("d1", "10X Chromium");
/// assert_eq!(doc.status, ProjectStatus::Received);
/// assert!(doc.external_job_id.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectDocument {
    /// Document ID (`_id`)
    pub doc_id: String,
    /// Store revision (`_rev`), `None` until first saved
    pub rev: Option<String>,
    /// Classification key used for handler resolution
    pub library_prep_method: String,
    pub status: ProjectStatus,
    /// Present once an HPC job has been submitted or adopted
    pub external_job_id: Option<String>,
    /// Session-scoped; never serialized
    pub manual_submit: bool,
    /// Domain payload, opaque to the core
    pub payload: Map<String, Value>,
}

impl ProjectDocument {
    pub fn new(doc_id: impl Into<String>, library_prep_method: impl Into<String>) -> Self {
        let library_prep_method = library_prep_method.into();
        let mut payload = Map::new();
        payload.insert(
            METHOD_FIELD.to_string(),
            Value::String(library_prep_method.clone()),
        );

        Self {
            doc_id: doc_id.into(),
            rev: None,
            library_prep_method,
            status: ProjectStatus::Received,
            external_job_id: None,
            manual_submit: false,
            payload,
        }
    }

    /// Parse a raw store document
    ///
    /// The classification key is read from `library_prep_method`, falling back
    /// to `details.library_construction_method`. A missing or null `status`
    /// reads as `Received`; one that does not parse reads as `Unrecognized`
    /// and stays in the payload verbatim.
    pub fn from_json(value: Value) -> Result<Self> {
        let mut payload = match value {
            Value::Object(map) => map,
            other => {
                return Err(StorageError::serialization(format!(
                    "Project document must be a JSON object, got {}",
                    other
                )))
            }
        };

        let doc_id = match payload.remove("_id") {
            Some(Value::String(id)) => id,
            _ => {
                return Err(StorageError::serialization(
                    "Project document has no string `_id`",
                ))
            }
        };

        let rev = match payload.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            _ => None,
        };

        let status = match payload.get(STATUS_FIELD).filter(|v| !v.is_null()) {
            None => ProjectStatus::Received,
            Some(raw) => raw
                .as_str()
                .and_then(ProjectStatus::parse)
                .unwrap_or(ProjectStatus::Unrecognized),
        };
        if status != ProjectStatus::Unrecognized {
            payload.remove(STATUS_FIELD);
        }

        let external_job_id = match payload.remove(JOB_ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let library_prep_method = payload
            .get(METHOD_FIELD)
            .and_then(Value::as_str)
            .or_else(|| {
                payload
                    .get("details")
                    .and_then(|d| d.get("library_construction_method"))
                    .and_then(Value::as_str)
            })
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            doc_id,
            rev,
            library_prep_method,
            status,
            external_job_id,
            manual_submit: false,
            payload,
        })
    }

    /// Serialize back into the store representation
    pub fn to_json(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert("_id".to_string(), Value::String(self.doc_id.clone()));
        if let Some(rev) = &self.rev {
            map.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        if self.status != ProjectStatus::Unrecognized {
            map.insert(
                STATUS_FIELD.to_string(),
                Value::String(self.status.as_str().to_string()),
            );
        }
        if let Some(job_id) = &self.external_job_id {
            map.insert(JOB_ID_FIELD.to_string(), Value::String(job_id.clone()));
        }
        Value::Object(map)
    }

    /// Human-facing project id (`project_id` in the payload, else the doc id)
    pub fn project_id(&self) -> &str {
        self.payload
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or(&self.doc_id)
    }

    /// Document-level submission preference; missing means automatic
    pub fn auto_submit(&self) -> bool {
        self.payload
            .get("auto_submit")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_external_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.external_job_id = Some(job_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status Tracking
// ═══════════════════════════════════════════════════════════════════════════

/// Tracking entry for one project document
///
/// Created on first sighting, updated after every handling cycle, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "_id")]
    pub doc_id: String,
    /// Revision of the tracking record itself
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Last change-feed sequence token observed for the document
    #[serde(default)]
    pub last_seq: Option<String>,
    /// Project document revision after the last completed handling cycle
    #[serde(default)]
    pub handled_rev: Option<String>,
    #[serde(default)]
    pub last_status: Option<ProjectStatus>,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub last_handled_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev: None,
            last_seq: None,
            handled_rev: None,
            last_status: None,
            first_seen_at: Utc::now(),
            last_handled_at: None,
        }
    }

    /// True when `doc_rev` was already fully handled
    pub fn covers(&self, doc_rev: Option<&str>) -> bool {
        match (self.handled_rev.as_deref(), doc_rev) {
            (Some(handled), Some(current)) => handled == current,
            _ => false,
        }
    }

    pub fn mark_handled(&mut self, doc_rev: Option<String>, status: ProjectStatus) {
        self.handled_rev = doc_rev;
        self.last_status = Some(status);
        self.last_handled_at = Some(Utc::now());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Change Feed
// ═══════════════════════════════════════════════════════════════════════════

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub doc_id: String,
    pub seq: String,
    /// Current leaf revision of the changed document
    pub rev: Option<String>,
    pub deleted: bool,
}

/// One page of the change feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Cursor to pass as `since` on the next request
    pub last_seq: Option<String>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Normalise a sequence token (numeric in CouchDB 1.x, opaque string since 2.x)
pub fn seq_to_string(seq: &Value) -> Option<String> {
    match seq {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Typed access to project documents and status-tracking records
///
/// Implementations must be safe for concurrent use from many tasks; the store
/// itself arbitrates revision conflicts.
///
/// # Implementations
///
/// - `CouchDbStore`: CouchDB over HTTP (feature `couchdb`)
/// - `InMemoryStore`: same revision semantics, in process
#[async_trait]
pub trait ProjectStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Project Documents
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch a project document, `None` if it does not exist
    async fn fetch_project(&self, doc_id: &str) -> Result<Option<ProjectDocument>>;

    /// Save a project document and return its new revision
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Conflict` if `doc.rev` is not the current revision.
    async fn save_project(&self, doc: &ProjectDocument) -> Result<String>;

    /// Read the change feed after `since` (from the beginning if `None`)
    async fn changes_since(&self, since: Option<&str>, limit: usize) -> Result<ChangeBatch>;

    /// Documents left in a non-terminal, post-`Received` status
    async fn list_in_flight(&self) -> Result<Vec<ProjectDocument>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Status Tracking
    // ═══════════════════════════════════════════════════════════════════════

    async fn fetch_status_record(&self, doc_id: &str) -> Result<Option<StatusRecord>>;

    /// Save a status record and return its new revision
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Conflict` if `record.rev` is not the current
    /// revision (or is set for a record that does not exist yet).
    async fn save_status_record(&self, record: &StatusRecord) -> Result<String>;

    /// Last persisted change-feed cursor
    async fn load_cursor(&self) -> Result<Option<String>>;

    async fn save_cursor(&self, seq: &str) -> Result<()>;
}

/// Re-read, mutate, save; retry on stale-revision conflicts
///
/// `mutate` may veto the write by returning an error, which is passed through
/// unchanged. Returns the saved document carrying its new revision.
pub async fn update_project_with_retry<F, E>(
    store: &dyn ProjectStore,
    doc_id: &str,
    mut mutate: F,
) -> std::result::Result<ProjectDocument, E>
where
    F: FnMut(&mut ProjectDocument) -> std::result::Result<(), E> + Send,
    E: From<StorageError>,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let mut doc = store
            .fetch_project(doc_id)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("project document {}", doc_id)))?;

        mutate(&mut doc)?;

        match store.save_project(&doc).await {
            Ok(rev) => {
                doc.rev = Some(rev);
                return Ok(doc);
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    "Conflict saving {} (attempt {}/{}), re-reading",
                    doc_id,
                    attempt,
                    MAX_CONFLICT_RETRIES
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StorageError::conflict(doc_id).into())
}

/// Re-read, mutate, save a status record; retry on stale-revision conflicts
///
/// A missing record starts from `StatusRecord::new`. When `mutate` returns
/// `false` nothing is written and `None` is returned.
pub async fn update_status_record_with_retry<F>(
    store: &dyn ProjectStore,
    doc_id: &str,
    mut mutate: F,
) -> Result<Option<StatusRecord>>
where
    F: FnMut(&mut StatusRecord) -> bool + Send,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let mut record = store
            .fetch_status_record(doc_id)
            .await?
            .unwrap_or_else(|| StatusRecord::new(doc_id));

        if !mutate(&mut record) {
            return Ok(None);
        }

        match store.save_status_record(&record).await {
            Ok(rev) => {
                record.rev = Some(rev);
                return Ok(Some(record));
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    "Conflict saving status record {} (attempt {}/{}), re-reading",
                    doc_id,
                    attempt,
                    MAX_CONFLICT_RETRIES
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::conflict(doc_id))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
