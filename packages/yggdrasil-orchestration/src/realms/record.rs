use crate::error::{OrchestratorError, Result};
use crate::realm::{Outcome, RealmHandler, RealmServices};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Realm with no external job: logs and completes
///
/// Projects go `Processing → Finalizing → Completed`. Useful for methods
/// that only need bookkeeping, and for trigger files that only need to be
/// noted.
pub struct RecordRealm {
    name: String,
}

impl RecordRealm {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl RealmHandler for RecordRealm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        doc: &yggdrasil_storage::ProjectDocument,
        _services: &RealmServices,
    ) -> Result<Outcome> {
        info!(
            "Recorded project {} ({})",
            doc.project_id(),
            doc.library_prep_method
        );
        Ok(Outcome::Completed)
    }

    async fn handle_trigger(&self, path: &Path, _services: &RealmServices) -> Result<Outcome> {
        info!("Recorded trigger file {}", path.display());
        Ok(Outcome::Completed)
    }
}

/// `builtin.record`; option `name` overrides the handler name
pub fn record_factory(options: &Value) -> Result<Arc<dyn RealmHandler>> {
    let name = match options.get("name") {
        None | Some(Value::Null) => "record",
        Some(Value::String(name)) => name.as_str(),
        Some(other) => {
            return Err(OrchestratorError::config(format!(
                "builtin.record option 'name' must be a string, got {}",
                other
            )))
        }
    };
    Ok(Arc::new(RecordRealm::new(name)))
}
