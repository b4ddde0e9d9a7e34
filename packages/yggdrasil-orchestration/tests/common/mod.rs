//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use yggdrasil_orchestration::config::base_config;
use yggdrasil_orchestration::testing::ScriptedScheduler;
use yggdrasil_orchestration::{
    AppContext, HandlerRegistration, HandlerRegistry, ProjectDocument, ProjectStore, SessionFlags,
    SlurmScriptRealm, YggdrasilConfig,
};
use yggdrasil_storage::InMemoryStore;

pub const TENX_TEMPLATE: &str = "#!/bin/bash\n#SBATCH -J {doc_id}\n{activate_ngi_cmd}\ncellranger count --id {project_id}\n";

/// Fast intervals, logs under `log_dir`
pub fn test_config(log_dir: &Path) -> YggdrasilConfig {
    let mut config = base_config(log_dir);
    config.couchdb_poll_interval = 0.02;
    config.job_monitor_poll_interval = 0.02;
    config.shutdown_grace_period = 2.0;
    config.max_concurrent_handlers = 4;
    config
}

pub fn context(
    config: YggdrasilConfig,
    session: SessionFlags,
    store: Arc<InMemoryStore>,
    scheduler: Arc<ScriptedScheduler>,
    registrations: Vec<HandlerRegistration>,
) -> AppContext {
    let mut builder = HandlerRegistry::builder();
    for registration in registrations {
        builder.register(registration, "integration test").unwrap();
    }
    AppContext::new(config, session, store, builder.build(), scheduler)
}

/// `10X` prefix handler rendering a batch script
pub fn tenx_registration() -> HandlerRegistration {
    HandlerRegistration::for_handler(
        "10X",
        true,
        Arc::new(SlurmScriptRealm::new("tenx", TENX_TEMPLATE)),
    )
}

/// Poll the store until `pred` holds for `doc_id`
pub async fn wait_for<F>(store: &InMemoryStore, doc_id: &str, pred: F) -> ProjectDocument
where
    F: Fn(&ProjectDocument) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(doc) = store.fetch_project(doc_id).await.unwrap() {
            if pred(&doc) {
                return doc;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {}",
            doc_id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
