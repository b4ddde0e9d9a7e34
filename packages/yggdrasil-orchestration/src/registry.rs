//! Handler registry
//!
//! Maps a classification key to a realm handler. Resolution order:
//!
//! 1. exact key
//! 2. longest registered prefix of the key
//! 3. internal handlers whose `matches()` claims the key
//!
//! Registration happens once at startup through a [`RegistryBuilder`]; the
//! built [`HandlerRegistry`] is immutable and shared behind an `Arc`.
//! Duplicate keys within a match class are rejected at registration, which
//! also rules out equal-length prefix ties (two distinct prefixes of one key
//! cannot have the same length).

use crate::error::{OrchestratorError, Result};
use crate::realm::{HandlerFactory, RealmHandler};
use crate::sources::RegistrationSource;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Independent key spaces sharing the same precedence rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Keys are `library_prep_method` values
    Project,
    /// Keys are `<watcher name>/<relative path>`
    Trigger,
}

impl KeySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySpace::Project => "project",
            KeySpace::Trigger => "trigger",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(KeySpace::Project),
            "trigger" => Ok(KeySpace::Trigger),
            _ => Err(OrchestratorError::config(format!(
                "Invalid key space: {} (expected 'project' or 'trigger')",
                s
            ))),
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
    Internal,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Prefix => "prefix",
            MatchKind::Internal => "internal",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One advertised `(key, factory, is_prefix)` tuple
#[derive(Clone)]
pub struct HandlerRegistration {
    pub key: String,
    pub keyspace: KeySpace,
    pub is_prefix: bool,
    /// Module name the factory was looked up under, for logs
    pub module: String,
    pub factory: Arc<dyn HandlerFactory>,
    pub options: Value,
    /// Where the registration came from, if narrower than the source
    pub origin: Option<String>,
}

impl HandlerRegistration {
    pub fn exact(
        key: impl Into<String>,
        module: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            key: key.into(),
            keyspace: KeySpace::Project,
            is_prefix: false,
            module: module.into(),
            factory,
            options: Value::Null,
            origin: None,
        }
    }

    pub fn prefix(
        key: impl Into<String>,
        module: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            is_prefix: true,
            ..Self::exact(key, module, factory)
        }
    }

    /// Registration for an already-built handler
    pub fn for_handler(key: impl Into<String>, is_prefix: bool, handler: Arc<dyn RealmHandler>) -> Self {
        let module = handler.name().to_string();
        let factory: Arc<dyn HandlerFactory> =
            Arc::new(move |_: &Value| -> Result<Arc<dyn RealmHandler>> { Ok(handler.clone()) });
        Self {
            is_prefix,
            ..Self::exact(key, module, factory)
        }
    }

    pub fn in_keyspace(mut self, keyspace: KeySpace) -> Self {
        self.keyspace = keyspace;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    fn kind(&self) -> MatchKind {
        if self.is_prefix {
            MatchKind::Prefix
        } else {
            MatchKind::Exact
        }
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("key", &self.key)
            .field("keyspace", &self.keyspace)
            .field("is_prefix", &self.is_prefix)
            .field("module", &self.module)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A successful resolution
#[derive(Clone)]
pub struct Resolved {
    pub handler: Arc<dyn RealmHandler>,
    /// Registered key that matched (the handler name for internal matches)
    pub key: String,
    pub kind: MatchKind,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("handler", &self.handler.name())
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Entry {
    key: String,
    handler: Arc<dyn RealmHandler>,
}

#[derive(Default)]
struct KeyTable {
    exact: HashMap<String, Entry>,
    /// Sorted longest key first after `build()`
    prefixes: Vec<Entry>,
}

impl KeyTable {
    fn resolve(&self, key: &str) -> Option<Resolved> {
        if let Some(entry) = self.exact.get(key) {
            return Some(Resolved {
                handler: entry.handler.clone(),
                key: entry.key.clone(),
                kind: MatchKind::Exact,
            });
        }

        self.prefixes
            .iter()
            .find(|entry| key.starts_with(entry.key.as_str()))
            .map(|entry| Resolved {
                handler: entry.handler.clone(),
                key: entry.key.clone(),
                kind: MatchKind::Prefix,
            })
    }
}

/// Collects registrations at startup
#[derive(Default)]
pub struct RegistryBuilder {
    tables: HashMap<KeySpace, KeyTable>,
    internal: Vec<Arc<dyn RealmHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, instantiate and add one registration
    ///
    /// # Errors
    ///
    /// `OrchestratorError::Config` for a duplicate key within its match class
    /// or a factory that rejects its options.
    pub fn register(&mut self, registration: HandlerRegistration, source: &str) -> Result<()> {
        let table = self.tables.entry(registration.keyspace).or_default();
        let kind = registration.kind();

        let duplicate = match kind {
            MatchKind::Prefix => table.prefixes.iter().any(|e| e.key == registration.key),
            _ => table.exact.contains_key(&registration.key),
        };
        if duplicate {
            return Err(OrchestratorError::config(format!(
                "duplicate {} registration for {} key '{}' (module '{}' from {})",
                kind,
                registration.keyspace,
                registration.key,
                registration.module,
                registration.origin.as_deref().unwrap_or(source)
            )));
        }

        let handler = registration
            .factory
            .create(&registration.options)
            .map_err(|e| {
                OrchestratorError::config(format!(
                    "module '{}' for key '{}' failed to initialize: {}",
                    registration.module, registration.key, e
                ))
            })?;

        info!(
            "registered handler '{}' for {} key '{}' ({}) from {}",
            handler.name(),
            registration.keyspace,
            registration.key,
            kind,
            registration.origin.as_deref().unwrap_or(source)
        );

        let entry = Entry {
            key: registration.key.clone(),
            handler,
        };
        match kind {
            MatchKind::Prefix => table.prefixes.push(entry),
            _ => {
                table.exact.insert(registration.key, entry);
            }
        }
        Ok(())
    }

    /// Add a handler consulted through `matches()` after key lookup fails
    pub fn register_internal(&mut self, handler: Arc<dyn RealmHandler>) {
        info!("registered internal handler '{}'", handler.name());
        self.internal.push(handler);
    }

    /// Query a source once and register everything it advertises
    pub fn load(&mut self, source: &dyn RegistrationSource) -> Result<usize> {
        let registrations = source.registrations()?;
        let count = registrations.len();
        for registration in registrations {
            self.register(registration, source.name())?;
        }
        Ok(count)
    }

    pub fn build(mut self) -> HandlerRegistry {
        for table in self.tables.values_mut() {
            table
                .prefixes
                .sort_by(|a, b| b.key.len().cmp(&a.key.len()).then_with(|| a.key.cmp(&b.key)));
        }
        HandlerRegistry {
            tables: self.tables,
            internal: self.internal,
        }
    }
}

/// Immutable key → handler map
pub struct HandlerRegistry {
    tables: HashMap<KeySpace, KeyTable>,
    internal: Vec<Arc<dyn RealmHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve `key` within `keyspace`
    ///
    /// # Errors
    ///
    /// `OrchestratorError::Resolution` when nothing matches.
    pub fn resolve(&self, keyspace: KeySpace, key: &str) -> Result<Resolved> {
        if let Some(resolved) = self.tables.get(&keyspace).and_then(|t| t.resolve(key)) {
            return Ok(resolved);
        }

        if keyspace == KeySpace::Project {
            if let Some(handler) = self.internal.iter().find(|h| h.matches(key)) {
                return Ok(Resolved {
                    handler: handler.clone(),
                    key: handler.name().to_string(),
                    kind: MatchKind::Internal,
                });
            }
        }

        Err(OrchestratorError::Resolution {
            key: key.to_string(),
        })
    }

    pub fn resolve_project(&self, library_prep_method: &str) -> Result<Resolved> {
        self.resolve(KeySpace::Project, library_prep_method)
    }

    pub fn resolve_trigger(&self, key: &str) -> Result<Resolved> {
        self.resolve(KeySpace::Trigger, key)
    }

    /// Number of key registrations (internal handlers excluded)
    pub fn len(&self) -> usize {
        self.tables
            .values()
            .map(|t| t.exact.len() + t.prefixes.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.internal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::{FnRealm, Outcome, RealmServices};
    use proptest::prelude::*;
    use yggdrasil_storage::ProjectDocument;

    fn named(name: &str) -> Arc<dyn RealmHandler> {
        Arc::new(FnRealm::new(
            name.to_string(),
            |_doc: ProjectDocument, _services: RealmServices| async {
                Ok::<_, OrchestratorError>(Outcome::Completed)
            },
        ))
    }

    struct Claims(&'static str);

    #[async_trait::async_trait]
    impl RealmHandler for Claims {
        fn name(&self) -> &str {
            "claims"
        }

        fn matches(&self, method: &str) -> bool {
            method.contains(self.0)
        }

        async fn handle(&self, _doc: &ProjectDocument, _services: &RealmServices) -> Result<Outcome> {
            Ok(Outcome::Completed)
        }
    }

    fn tenx_registry() -> HandlerRegistry {
        let mut builder = HandlerRegistry::builder();
        builder
            .register(HandlerRegistration::for_handler("10X", true, named("tenx_prefix")), "test")
            .unwrap();
        builder
            .register(
                HandlerRegistration::for_handler("10X Chromium", false, named("tenx_exact")),
                "test",
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_exact_beats_prefix() {
        let registry = tenx_registry();

        let resolved = registry.resolve_project("10X Chromium").unwrap();
        assert_eq!(resolved.handler.name(), "tenx_exact");
        assert_eq!(resolved.kind, MatchKind::Exact);

        let resolved = registry.resolve_project("10X Other").unwrap();
        assert_eq!(resolved.handler.name(), "tenx_prefix");
        assert_eq!(resolved.kind, MatchKind::Prefix);
        assert_eq!(resolved.key, "10X");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut builder = HandlerRegistry::builder();
        for (key, name) in [("Smart", "short"), ("SmartSeq 3", "long"), ("SmartSeq", "mid")] {
            builder
                .register(HandlerRegistration::for_handler(key, true, named(name)), "test")
                .unwrap();
        }
        let registry = builder.build();

        assert_eq!(registry.resolve_project("SmartSeq 3 v2").unwrap().handler.name(), "long");
        assert_eq!(registry.resolve_project("SmartSeq 2").unwrap().handler.name(), "mid");
        assert_eq!(registry.resolve_project("Smarter").unwrap().handler.name(), "short");
    }

    #[test]
    fn test_unknown_key_is_resolution_error() {
        let registry = tenx_registry();
        let err = registry.resolve_project("Unknown Method").unwrap_err();
        assert!(matches!(err, OrchestratorError::Resolution { ref key } if key == "Unknown Method"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_duplicate_exact_rejected() {
        let mut builder = HandlerRegistry::builder();
        builder
            .register(HandlerRegistration::for_handler("10X Chromium", false, named("a")), "test")
            .unwrap();
        let err = builder
            .register(HandlerRegistration::for_handler("10X Chromium", false, named("b")), "test")
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_duplicate_prefix_rejected_but_classes_independent() {
        let mut builder = HandlerRegistry::builder();
        builder
            .register(HandlerRegistration::for_handler("10X", true, named("a")), "test")
            .unwrap();
        // Same key in the other match class is fine
        builder
            .register(HandlerRegistration::for_handler("10X", false, named("b")), "test")
            .unwrap();
        assert!(builder
            .register(HandlerRegistration::for_handler("10X", true, named("c")), "test")
            .is_err());
    }

    #[test]
    fn test_keyspaces_are_separate() {
        let mut builder = HandlerRegistry::builder();
        builder
            .register(
                HandlerRegistration::for_handler("seq/", true, named("seq_trigger"))
                    .in_keyspace(KeySpace::Trigger),
                "test",
            )
            .unwrap();
        let registry = builder.build();

        assert!(registry.resolve_project("seq/run1").is_err());
        assert_eq!(
            registry.resolve_trigger("seq/run1/RTAComplete.txt").unwrap().handler.name(),
            "seq_trigger"
        );
    }

    #[test]
    fn test_internal_matchers_are_last_resort() {
        let mut builder = HandlerRegistry::builder();
        builder
            .register(HandlerRegistration::for_handler("10X", true, named("tenx")), "test")
            .unwrap();
        builder.register_internal(Arc::new(Claims("X")));
        let registry = builder.build();

        assert_eq!(registry.resolve_project("10X Multiome").unwrap().handler.name(), "tenx");
        let resolved = registry.resolve_project("Xenium").unwrap();
        assert_eq!(resolved.kind, MatchKind::Internal);
        assert!(registry.resolve_trigger("Xenium").is_err());
    }

    #[test]
    fn test_failing_factory_is_config_error() {
        let factory: Arc<dyn HandlerFactory> = Arc::new(|_: &Value| -> Result<Arc<dyn RealmHandler>> {
            Err(OrchestratorError::config("missing option 'template'"))
        });
        let mut builder = HandlerRegistry::builder();
        let err = builder
            .register(HandlerRegistration::exact("x", "broken", factory), "test")
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_keyspace_roundtrip() {
        for keyspace in [KeySpace::Project, KeySpace::Trigger] {
            assert_eq!(KeySpace::from_str(keyspace.as_str()).unwrap(), keyspace);
        }
        assert!(KeySpace::from_str("bogus").is_err());
    }

    proptest! {
        #[test]
        fn prop_resolution_is_longest_matching_prefix(
            prefixes in proptest::collection::btree_set("[ab]{1,4}", 1..8),
            key in "[ab]{0,6}",
        ) {
            let mut builder = HandlerRegistry::builder();
            for prefix in &prefixes {
                builder
                    .register(HandlerRegistration::for_handler(prefix.clone(), true, named(prefix)), "prop")
                    .unwrap();
            }
            let registry = builder.build();

            let expected = prefixes
                .iter()
                .filter(|p| key.starts_with(p.as_str()))
                .max_by_key(|p| p.len());

            match (registry.resolve_project(&key), expected) {
                (Ok(resolved), Some(expected)) => prop_assert_eq!(&resolved.key, expected),
                (Err(_), None) => {}
                (got, expected) => prop_assert!(false, "got {:?}, expected {:?}", got.ok(), expected),
            }
        }

        #[test]
        fn prop_exact_always_wins(key in "[a-z ]{1,10}") {
            let mut builder = HandlerRegistry::builder();
            builder
                .register(HandlerRegistration::for_handler(key.clone(), false, named("exact")), "prop")
                .unwrap();
            builder
                .register(HandlerRegistration::for_handler(key.clone(), true, named("prefix")), "prop")
                .unwrap();
            let registry = builder.build();

            let resolved = registry.resolve_project(&key).unwrap();
            prop_assert_eq!(resolved.handler.name(), "exact");
        }
    }
}
