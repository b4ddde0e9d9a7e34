//! Project state store for the Yggdrasil orchestrator
//!
//! Typed access to two document databases:
//!
//! - the **project database**, holding one document per unit of work, whose
//!   change feed drives the orchestrator
//! - the **status-tracking database**, holding one `StatusRecord` per project
//!   plus the persisted change-feed cursor
//!
//! ## Core Principles
//!
//! 1. **Optimistic concurrency**: every save carries the revision it was read at;
//!    a stale revision is a `Conflict`, never a silent overwrite
//! 2. **Opaque payload**: only `status` and `external_job_id` are written by the
//!    core, all other fields round-trip untouched
//! 3. **Single port**: the orchestrator only ever talks to `ProjectStore`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use yggdrasil_storage::{update_project_with_retry, ProjectStatus, ProjectStore, StorageError};
//!
//! let doc = update_project_with_retry(store.as_ref(), "d1", |doc| {
//!     doc.status = ProjectStatus::Queued;
//!     Ok::<(), StorageError>(())
//! })
//! .await?;
//! println!("saved at {:?}", doc.rev);
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    update_project_with_retry, update_status_record_with_retry, Change, ChangeBatch,
    ProjectDocument, ProjectStatus, ProjectStore, StatusRecord, CURSOR_DOC_ID,
    MAX_CONFLICT_RETRIES,
};

pub use infrastructure::InMemoryStore;

#[cfg(feature = "couchdb")]
pub use infrastructure::{CouchDbConfig, CouchDbStore};
