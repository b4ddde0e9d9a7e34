use crate::error::{OrchestratorError, Result};
use crate::realm::{Outcome, RealmHandler, RealmServices};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use yggdrasil_storage::ProjectDocument;

/// Options accepted by `builtin.slurm_script`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlurmScriptOptions {
    /// Path of the batch script template
    template: PathBuf,
    #[serde(default)]
    name: Option<String>,
    /// Extra `{placeholder}` values
    #[serde(default)]
    args: BTreeMap<String, String>,
    #[serde(default = "default_auto_submit")]
    auto_submit: bool,
}

fn default_auto_submit() -> bool {
    true
}

/// Realm that renders a batch script and hands it to the job monitor
///
/// Placeholders: `{doc_id}`, `{project_id}`, `{library_prep_method}`,
/// `{activate_ngi_cmd}`, `{log_dir}` plus any `args` from the options. The
/// script lands in `<yggdrasil_log_dir>/<doc_id>/<doc_id>.sh` and is written
/// in manual mode too, so the operator has something to submit.
pub struct SlurmScriptRealm {
    name: String,
    template: String,
    args: BTreeMap<String, String>,
    auto_submit: bool,
}

impl SlurmScriptRealm {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            args: BTreeMap::new(),
            auto_submit: true,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn render(&self, doc: &ProjectDocument, services: &RealmServices) -> String {
        let config = services.config();
        let log_dir = config.yggdrasil_log_dir.display().to_string();

        let mut values: Vec<(&str, &str)> = vec![
            ("doc_id", doc.doc_id.as_str()),
            ("project_id", doc.project_id()),
            ("library_prep_method", doc.library_prep_method.as_str()),
            ("activate_ngi_cmd", config.activate_ngi_cmd.as_deref().unwrap_or("")),
            ("log_dir", log_dir.as_str()),
        ];
        values.extend(self.args.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        values.iter().fold(self.template.clone(), |script, (key, value)| {
            script.replace(&format!("{{{}}}", key), value)
        })
    }

    /// `<log_dir>/<doc_id>/<doc_id>.sh`
    pub fn script_path(doc: &ProjectDocument, services: &RealmServices) -> PathBuf {
        services
            .config()
            .yggdrasil_log_dir
            .join(&doc.doc_id)
            .join(format!("{}.sh", doc.doc_id))
    }

    async fn write_script(&self, doc: &ProjectDocument, services: &RealmServices) -> Result<PathBuf> {
        let path = Self::script_path(doc, services);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, self.render(doc, services)).await?;
        debug!("Wrote batch script {}", path.display());
        Ok(path)
    }
}

#[async_trait]
impl RealmHandler for SlurmScriptRealm {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_auto_submit(&self) -> bool {
        self.auto_submit
    }

    async fn handle(&self, doc: &ProjectDocument, services: &RealmServices) -> Result<Outcome> {
        let monitor = services.job_monitor();
        let mode = services.submission_mode(doc, self);

        // A recorded id is adopted; no script needed
        let script = if doc.external_job_id.is_some() {
            None
        } else {
            Some(self.write_script(doc, services).await?)
        };

        let handle = monitor
            .submit_or_adopt(doc, script.as_deref(), mode)
            .await?;
        info!(
            "Project {} bound to job {} ({:?})",
            doc.doc_id,
            handle.job_id.as_deref().unwrap_or("<pending manual submission>"),
            mode
        );
        Ok(Outcome::AwaitingJob(handle))
    }
}

/// `builtin.slurm_script`
///
/// ```json
/// { "template": "/opt/ygg/templates/10x.sh", "args": { "partition": "core" } }
/// ```
pub fn slurm_script_factory(options: &Value) -> Result<Arc<dyn RealmHandler>> {
    let options: SlurmScriptOptions = serde_json::from_value(options.clone())
        .map_err(|e| OrchestratorError::config(format!("builtin.slurm_script options: {}", e)))?;

    let template = std::fs::read_to_string(&options.template).map_err(|e| {
        OrchestratorError::config(format!(
            "cannot read batch template {}: {}",
            options.template.display(),
            e
        ))
    })?;

    let name = options.name.unwrap_or_else(|| template_name(&options.template));
    let mut realm = SlurmScriptRealm::new(name, template);
    realm.args = options.args;
    realm.auto_submit = options.auto_submit;
    Ok(Arc::new(realm))
}

fn template_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| format!("slurm_script:{}", s))
        .unwrap_or_else(|| "slurm_script".to_string())
}
