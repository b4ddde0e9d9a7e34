/*
 * Yggdrasil Orchestration - project pipeline daemon
 *
 * Watches a CouchDB change feed and trigger directories, and drives each
 * project document through its lifecycle by delegating the domain work to
 * pluggable realm handlers.
 *
 * Architecture:
 * - Change Watchers (CouchDB change feed, trigger directories)
 * - Dispatcher (at most one active handler per project)
 * - Handler Registry (exact > longest prefix > internal matchers)
 * - Project State Machine (persisted through the store, conflict-retried)
 * - Job Monitor (Slurm submit / adopt / poll, restart-safe)
 */

// Public modules
pub mod config;
pub mod context;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod job_monitor;
pub mod logging;
pub mod project;
pub mod realm;
pub mod realms;
pub mod registry;
pub mod slurm;
pub mod sources;
pub mod testing;
pub mod watcher;

// Re-exports
pub use config::{ConfigError, SessionFlags, SlurmConfig, TriggerWatchConfig, YggdrasilConfig};
pub use context::AppContext;
pub use daemon::{bootstrap, build_registry, run_doc, Daemon};
pub use dispatcher::{DispatchDecision, Dispatcher, ProjectReport, TaskReport};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use event::{Event, EventSink, Signal};
pub use job_monitor::{JobHandle, JobMonitor, JobResult, JobScheduler, JobState, SubmissionMode};
pub use project::{can_transition, persist_transition, ProjectStateMachine};
pub use realm::{FnRealm, HandlerFactory, Outcome, RealmHandler, RealmServices};
pub use realms::{FactoryCatalog, RecordRealm, SlurmScriptRealm};
pub use registry::{HandlerRegistration, HandlerRegistry, KeySpace, MatchKind, RegistryBuilder, Resolved};
pub use slurm::SlurmScheduler;
pub use sources::{MappingFileSource, PluginManifestSource, RegistrationSource, StaticSource};
pub use watcher::{ChangePoller, TriggerWatcher};

pub use yggdrasil_storage::{ProjectDocument, ProjectStatus, ProjectStore};
