//! Daemon configuration
//!
//! Loaded once at startup from a JSON file (`config.json` unless `--config` or
//! `YGG_CONFIG` says otherwise). Under `--dev` a sibling `<stem>.dev.json` is
//! merged over the base file key by key before deserialization.

use crate::error::OrchestratorError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const CONFIG_ENV: &str = "YGG_CONFIG";
pub const COUCH_USER_ENV: &str = "COUCH_USER";
pub const COUCH_PASS_ENV: &str = "COUCH_PASS";

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required field '{0}'")]
    Missing(String),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

/// Validation hook run after loading
pub trait Validatable {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// One filesystem trigger directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerWatchConfig {
    /// Key-space prefix for trigger keys (`<name>/<relative path>`)
    pub name: String,
    pub directory: PathBuf,
    /// File names that count as triggers; empty means any file
    #[serde(default)]
    pub marker_files: Vec<String>,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl TriggerWatchConfig {
    pub fn is_marker(&self, path: &Path) -> bool {
        if self.marker_files.is_empty() {
            return true;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.marker_files.iter().any(|m| m == n))
            .unwrap_or(false)
    }
}

/// Slurm command settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub sbatch: String,
    pub sacct: String,
    /// Seconds before an `sbatch`/`sacct` invocation is abandoned
    pub command_timeout: f64,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            command_timeout: 8.0,
        }
    }
}

/// Typed daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YggdrasilConfig {
    #[serde(default)]
    pub couchdb_url: String,
    #[serde(default)]
    pub couchdb_database: String,
    #[serde(default)]
    pub couchdb_status_tracking: String,
    #[serde(default)]
    pub couchdb_user: Option<String>,
    #[serde(default)]
    pub couchdb_password: Option<String>,
    /// Seconds between change-feed polls
    #[serde(default = "default_couch_poll")]
    pub couchdb_poll_interval: f64,
    /// Seconds between job status polls
    #[serde(default = "default_job_poll")]
    pub job_monitor_poll_interval: f64,
    #[serde(default)]
    pub yggdrasil_log_dir: PathBuf,
    /// Opaque activation command handed to realms
    #[serde(default, deserialize_with = "none_string")]
    pub activate_ngi_cmd: Option<String>,
    #[serde(default = "default_module_registry")]
    pub module_registry: PathBuf,
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub trigger_watch: Vec<TriggerWatchConfig>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_handlers: usize,
    /// Seconds granted to in-flight handlers on shutdown
    #[serde(default = "default_grace")]
    pub shutdown_grace_period: f64,
    #[serde(default)]
    pub slurm: SlurmConfig,
}

fn default_true() -> bool {
    true
}

fn default_couch_poll() -> f64 {
    5.0
}

fn default_job_poll() -> f64 {
    5.0
}

fn default_module_registry() -> PathBuf {
    PathBuf::from("module_registry.json")
}

fn default_max_concurrent() -> usize {
    num_cpus::get()
}

fn default_grace() -> f64 {
    30.0
}

/// `null`, missing, empty and the literal `"None"` all mean no command
fn none_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| {
        let s = s.trim();
        !s.is_empty() && s != "None"
    }))
}

impl Default for YggdrasilConfig {
    fn default() -> Self {
        Self {
            couchdb_url: String::new(),
            couchdb_database: String::new(),
            couchdb_status_tracking: String::new(),
            couchdb_user: None,
            couchdb_password: None,
            couchdb_poll_interval: default_couch_poll(),
            job_monitor_poll_interval: default_job_poll(),
            yggdrasil_log_dir: PathBuf::new(),
            activate_ngi_cmd: None,
            module_registry: default_module_registry(),
            plugin_dir: None,
            trigger_watch: Vec::new(),
            max_concurrent_handlers: default_max_concurrent(),
            shutdown_grace_period: default_grace(),
            slurm: SlurmConfig::default(),
        }
    }
}

impl YggdrasilConfig {
    /// Resolve the config path: explicit flag, then `YGG_CONFIG`, then `config.json`
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load, apply dev overrides and credentials from the environment, validate
    pub fn load(path: &Path, dev: bool) -> Result<Self, ConfigError> {
        let mut value = read_json(path)?;

        if dev {
            let dev_path = dev_override_path(path);
            if dev_path.exists() {
                let overrides = read_json(&dev_path)?;
                merge_top_level(&mut value, overrides);
            }
        }

        let mut config: YggdrasilConfig =
            serde_json::from_value(value).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        config.apply_env(
            std::env::var(COUCH_USER_ENV).ok(),
            std::env::var(COUCH_PASS_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Environment credentials win over the file
    pub fn apply_env(&mut self, user: Option<String>, password: Option<String>) {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            self.couchdb_user = Some(user);
        }
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.couchdb_password = Some(password);
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.couchdb_poll_interval)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.job_monitor_poll_interval)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_period)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.slurm.command_timeout)
    }
}

impl Validatable for YggdrasilConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("couchdb_url", &self.couchdb_url),
            ("couchdb_database", &self.couchdb_database),
            ("couchdb_status_tracking", &self.couchdb_status_tracking),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(field.to_string()));
            }
        }

        if self.yggdrasil_log_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("yggdrasil_log_dir".to_string()));
        }

        for (field, seconds) in [
            ("couchdb_poll_interval", self.couchdb_poll_interval),
            ("job_monitor_poll_interval", self.job_monitor_poll_interval),
            ("slurm.command_timeout", self.slurm.command_timeout),
        ] {
            if !(seconds.is_finite() && seconds > 0.0) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("must be a positive number of seconds, got {}", seconds),
                });
            }
        }

        if !(self.shutdown_grace_period.is_finite() && self.shutdown_grace_period >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "shutdown_grace_period".to_string(),
                reason: "must be zero or more seconds".to_string(),
            });
        }

        if self.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_handlers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut names = std::collections::HashSet::new();
        for watch in &self.trigger_watch {
            if watch.name.is_empty() || watch.name.contains('/') {
                return Err(ConfigError::Invalid {
                    field: "trigger_watch.name".to_string(),
                    reason: format!("'{}' must be non-empty and contain no '/'", watch.name),
                });
            }
            if !names.insert(watch.name.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "trigger_watch.name".to_string(),
                    reason: format!("duplicate watcher name '{}'", watch.name),
                });
            }
        }

        Ok(())
    }
}

/// Session-scoped flags, fixed at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub dev: bool,
    pub manual_submit: bool,
}

impl SessionFlags {
    pub fn new(dev: bool, manual_submit: bool) -> Self {
        Self { dev, manual_submit }
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// `config.json` → `config.dev.json`
pub fn dev_override_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config");
    path.with_file_name(format!("{}.dev.json", stem))
}

fn merge_top_level(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                base.insert(key, value);
            }
        }
        (base, overrides) => *base = overrides,
    }
}

/// Minimal valid configuration, used by tests and embedders
pub fn base_config(log_dir: impl Into<PathBuf>) -> YggdrasilConfig {
    YggdrasilConfig {
        couchdb_url: "http://localhost:5984".to_string(),
        couchdb_database: "projects".to_string(),
        couchdb_status_tracking: "yggdrasil".to_string(),
        yggdrasil_log_dir: log_dir.into(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    const BASE: &str = r#"{
        "couchdb_url": "http://couch:5984",
        "couchdb_database": "projects",
        "couchdb_status_tracking": "yggdrasil",
        "couchdb_poll_interval": 3,
        "job_monitor_poll_interval": 0.5,
        "yggdrasil_log_dir": "/tmp/ygg",
        "activate_ngi_cmd": "None"
    }"#;

    #[test]
    fn test_load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "config.json", BASE);

        let config = YggdrasilConfig::load(&path, false).unwrap();
        assert_eq!(config.couchdb_url, "http://couch:5984");
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.job_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.activate_ngi_cmd, None);
        assert_eq!(config.module_registry, PathBuf::from("module_registry.json"));
        assert_eq!(config.slurm.sbatch, "sbatch");
        assert_eq!(config.command_timeout(), Duration::from_secs(8));
        assert!(config.max_concurrent_handlers >= 1);
    }

    #[test]
    fn test_activate_cmd_kept_when_set() {
        let value = serde_json::json!({"activate_ngi_cmd": "source /opt/ngi/activate"});
        let config: YggdrasilConfig = serde_json::from_value(value).unwrap();
        assert_eq!(
            config.activate_ngi_cmd.as_deref(),
            Some("source /opt/ngi/activate")
        );

        let value = serde_json::json!({"activate_ngi_cmd": null});
        let config: YggdrasilConfig = serde_json::from_value(value).unwrap();
        assert!(config.activate_ngi_cmd.is_none());
    }

    #[test]
    fn test_dev_override_merges_only_in_dev() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "config.json", BASE);
        write_file(
            &dir,
            "config.dev.json",
            r#"{"couchdb_database": "projects_dev"}"#,
        );

        let prod = YggdrasilConfig::load(&path, false).unwrap();
        assert_eq!(prod.couchdb_database, "projects");

        let dev = YggdrasilConfig::load(&path, true).unwrap();
        assert_eq!(dev.couchdb_database, "projects_dev");
        assert_eq!(dev.couchdb_url, "http://couch:5984");
    }

    #[test]
    fn test_missing_required_field() {
        let mut config = base_config("/tmp/ygg");
        config.couchdb_status_tracking = " ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing(field)) if field == "couchdb_status_tracking"
        ));
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        let mut config = base_config("/tmp/ygg");
        config.couchdb_poll_interval = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "couchdb_poll_interval"
        ));
    }

    #[test]
    fn test_duplicate_trigger_names_rejected() {
        let mut config = base_config("/tmp/ygg");
        let watch = TriggerWatchConfig {
            name: "seq".to_string(),
            directory: PathBuf::from("/data"),
            marker_files: vec![],
            recursive: true,
        };
        config.trigger_watch = vec![watch.clone(), watch];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_credentials_override_file() {
        let mut config = base_config("/tmp/ygg");
        config.couchdb_user = Some("file-user".to_string());
        config.apply_env(Some("env-user".to_string()), None);
        assert_eq!(config.couchdb_user.as_deref(), Some("env-user"));
        assert!(config.couchdb_password.is_none());
    }

    #[test]
    fn test_unreadable_file() {
        let err = YggdrasilConfig::load(Path::new("/nonexistent/ygg.json"), false).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        let orchestrator: OrchestratorError = err.into();
        assert!(orchestrator.is_fatal());
    }

    #[test]
    fn test_marker_matching() {
        let watch = TriggerWatchConfig {
            name: "seq".to_string(),
            directory: PathBuf::from("/data"),
            marker_files: vec!["RTAComplete.txt".to_string()],
            recursive: true,
        };
        assert!(watch.is_marker(Path::new("/data/run1/RTAComplete.txt")));
        assert!(!watch.is_marker(Path::new("/data/run1/SampleSheet.csv")));
    }

    #[test]
    fn test_dev_override_path() {
        assert_eq!(
            dev_override_path(Path::new("/etc/ygg/config.json")),
            PathBuf::from("/etc/ygg/config.dev.json")
        );
    }
}
