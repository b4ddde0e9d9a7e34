//! Built-in realms and the factory catalog
//!
//! Mapping files and plugin manifests name handler factories by module
//! string (`builtin.record`, `builtin.slurm_script`). The catalog resolves
//! those names; embedders can insert their own factories before loading.

mod record;
mod slurm_script;

pub use record::{record_factory, RecordRealm};
pub use slurm_script::{slurm_script_factory, SlurmScriptRealm};

use crate::error::{OrchestratorError, Result};
use crate::realm::HandlerFactory;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const RECORD_MODULE: &str = "builtin.record";
pub const SLURM_SCRIPT_MODULE: &str = "builtin.slurm_script";

/// Named handler factories
#[derive(Default, Clone)]
pub struct FactoryCatalog {
    factories: BTreeMap<String, Arc<dyn HandlerFactory>>,
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in modules
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.insert(RECORD_MODULE, Arc::new(record_factory));
        catalog.insert(SLURM_SCRIPT_MODULE, Arc::new(slurm_script_factory));
        catalog
    }

    /// Add or replace a module
    pub fn insert(&mut self, module: impl Into<String>, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(module.into(), factory);
    }

    pub fn get(&self, module: &str) -> Result<Arc<dyn HandlerFactory>> {
        self.factories.get(module).cloned().ok_or_else(|| {
            OrchestratorError::config(format!(
                "unknown handler module '{}' (known: {})",
                module,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_builtins_present() {
        let catalog = FactoryCatalog::with_builtins();
        assert_eq!(catalog.names(), vec![RECORD_MODULE, SLURM_SCRIPT_MODULE]);

        let handler = catalog.get(RECORD_MODULE).unwrap().create(&Value::Null).unwrap();
        assert_eq!(handler.name(), "record");
    }

    #[test]
    fn test_unknown_module() {
        let err = FactoryCatalog::new().get("x.y").err().unwrap();
        assert!(err.is_fatal());
    }
}
