//! Registration sources
//!
//! Each source is queried exactly once at startup and returns the
//! registrations it advertises. The registry never re-queries, so it stays
//! immutable after `build()`.

use crate::error::{OrchestratorError, Result};
use crate::realms::FactoryCatalog;
use crate::registry::{HandlerRegistration, KeySpace};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Something that advertises `(key, factory, is_prefix)` tuples
pub trait RegistrationSource: Send + Sync {
    /// Name used in registration logs
    fn name(&self) -> &str;

    fn registrations(&self) -> Result<Vec<HandlerRegistration>>;
}

/// In-code registrations
pub struct StaticSource {
    name: String,
    registrations: Vec<HandlerRegistration>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, registrations: Vec<HandlerRegistration>) -> Self {
        Self {
            name: name.into(),
            registrations,
        }
    }
}

impl RegistrationSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn registrations(&self) -> Result<Vec<HandlerRegistration>> {
        Ok(self.registrations.clone())
    }
}

/// One handler entry as written in a mapping file or manifest
#[derive(Debug, Clone, Deserialize)]
struct HandlerEntry {
    module: String,
    #[serde(default)]
    prefix: bool,
    #[serde(default)]
    keyspace: Option<String>,
    #[serde(default)]
    options: Value,
}

impl HandlerEntry {
    fn into_registration(
        self,
        key: String,
        catalog: &FactoryCatalog,
        origin: &str,
    ) -> Result<HandlerRegistration> {
        let keyspace = match self.keyspace.as_deref() {
            Some(ks) => KeySpace::from_str(ks)?,
            None => KeySpace::Project,
        };
        let factory = catalog.get(&self.module).map_err(|e| {
            OrchestratorError::config(format!("{} (key '{}' in {})", e, key, origin))
        })?;

        let registration = if self.prefix {
            HandlerRegistration::prefix(key, self.module, factory)
        } else {
            HandlerRegistration::exact(key, self.module, factory)
        };
        Ok(registration
            .in_keyspace(keyspace)
            .with_options(self.options)
            .with_origin(origin))
    }
}

/// Registry mapping file
///
/// ```json
/// {
///   "10X Chromium": { "module": "builtin.slurm_script", "options": { "template": "..." } },
///   "SmartSeq":     { "module": "builtin.record", "prefix": true },
///   "seq/":         { "module": "builtin.record", "prefix": true, "keyspace": "trigger" }
/// }
/// ```
pub struct MappingFileSource {
    path: PathBuf,
    catalog: Arc<FactoryCatalog>,
    name: String,
}

impl MappingFileSource {
    pub fn new(path: impl Into<PathBuf>, catalog: Arc<FactoryCatalog>) -> Self {
        let path = path.into();
        let name = format!("mapping file {}", path.display());
        Self {
            path,
            catalog,
            name,
        }
    }

    /// Parse a mapping document already in memory
    pub fn parse(text: &str, catalog: &FactoryCatalog, origin: &str) -> Result<Vec<HandlerRegistration>> {
        let entries: BTreeMap<String, HandlerEntry> = serde_json::from_str(text)
            .map_err(|e| OrchestratorError::config(format!("invalid registry mapping {}: {}", origin, e)))?;

        entries
            .into_iter()
            .map(|(key, entry)| entry.into_registration(key, catalog, origin))
            .collect()
    }
}

impl RegistrationSource for MappingFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn registrations(&self) -> Result<Vec<HandlerRegistration>> {
        let text = read_config_file(&self.path)?;
        Self::parse(&text, &self.catalog, &self.path.display().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct PluginManifest {
    plugin: String,
    #[serde(default)]
    handlers: Vec<ManifestHandler>,
}

#[derive(Debug, Deserialize)]
struct ManifestHandler {
    key: String,
    #[serde(flatten)]
    entry: HandlerEntry,
}

/// Plugin manifests: every `*.json` file in a directory
///
/// ```json
/// { "plugin": "smartseq3", "handlers": [
///     { "key": "SmartSeq 3", "module": "builtin.slurm_script", "options": { "template": "..." } }
/// ] }
/// ```
///
/// Files are read in name order so registration logs are stable.
pub struct PluginManifestSource {
    dir: PathBuf,
    catalog: Arc<FactoryCatalog>,
    name: String,
}

impl PluginManifestSource {
    pub fn new(dir: impl Into<PathBuf>, catalog: Arc<FactoryCatalog>) -> Self {
        let dir = dir.into();
        let name = format!("plugin dir {}", dir.display());
        Self { dir, catalog, name }
    }

    fn manifest_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            OrchestratorError::config(format!("cannot read plugin dir {}: {}", self.dir.display(), e))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl RegistrationSource for PluginManifestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn registrations(&self) -> Result<Vec<HandlerRegistration>> {
        let mut registrations = Vec::new();

        for path in self.manifest_paths()? {
            let text = read_config_file(&path)?;
            let manifest: PluginManifest = serde_json::from_str(&text).map_err(|e| {
                OrchestratorError::config(format!("invalid plugin manifest {}: {}", path.display(), e))
            })?;

            debug!(
                "Plugin '{}' advertises {} handler(s) in {}",
                manifest.plugin,
                manifest.handlers.len(),
                path.display()
            );
            let origin = format!("plugin '{}'", manifest.plugin);
            for handler in manifest.handlers {
                registrations.push(handler.entry.into_registration(handler.key, &self.catalog, &origin)?);
            }
        }

        info!("Discovered {} plugin registration(s) in {}", registrations.len(), self.dir.display());
        Ok(registrations)
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| OrchestratorError::config(format!("cannot read {}: {}", path.display(), e)))
}
