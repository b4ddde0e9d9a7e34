//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process store with CouchDB revision semantics
//! - `couchdb`: CouchDB over HTTP (feature `couchdb`)

pub mod memory;

#[cfg(feature = "couchdb")]
pub mod couchdb;

pub use memory::InMemoryStore;

#[cfg(feature = "couchdb")]
pub use couchdb::{CouchDbConfig, CouchDbStore};
