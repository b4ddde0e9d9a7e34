//! Change watchers
//!
//! Two independent polling loops feed one event stream:
//!
//! - [`ChangePoller`]: the document store's change feed → `ProjectChanged`
//! - [`TriggerWatcher`]: a directory of trigger files → `FileTrigger`
//!
//! Both stop at their next suspension point once the shutdown token is
//! cancelled, and deliver events only whole through [`EventSink`].
//!
//! [`EventSink`]: crate::event::EventSink

mod couchdb;
mod trigger;

pub use couchdb::{ChangePoller, DEFAULT_BATCH_LIMIT};
pub use trigger::{trigger_key, TriggerWatcher};
