//! In-process `ProjectStore` with CouchDB revision semantics
//!
//! Used by tests and embedders. Revisions are `<generation>-mem`, the change
//! feed keeps only the latest sequence per document (as CouchDB does), and a
//! save carrying a stale `_rev` is rejected with `Conflict`.

use crate::domain::{
    Change, ChangeBatch, ProjectDocument, ProjectStore, StatusRecord,
};
use crate::{Result, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct StoredProject {
    value: Value,
    generation: u64,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, StoredProject>,
    /// seq → doc_id, latest change only
    feed: BTreeMap<u64, String>,
    last_seq: u64,
    records: HashMap<String, (u64, StatusRecord)>,
    cursor: Option<String>,
}

/// In-memory project store
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    project_saves: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document as an external producer would, ignoring `_rev`
    ///
    /// Returns the new revision.
    pub fn seed(&self, doc: ProjectDocument) -> String {
        let mut inner = self.inner.lock();
        let generation = inner
            .projects
            .get(&doc.doc_id)
            .map(|p| p.generation)
            .unwrap_or(0)
            + 1;
        Self::write(&mut inner, &doc, generation)
    }

    /// Raw stored JSON of a project document
    pub fn raw_project(&self, doc_id: &str) -> Option<Value> {
        self.inner.lock().projects.get(doc_id).map(|p| p.value.clone())
    }

    /// Number of successful `save_project` calls
    pub fn project_saves(&self) -> usize {
        self.project_saves.load(Ordering::SeqCst)
    }

    /// Make every call fail with a connection error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::connection("in-memory store marked unavailable"));
        }
        Ok(())
    }

    fn write(inner: &mut Inner, doc: &ProjectDocument, generation: u64) -> String {
        let rev = format!("{}-mem", generation);
        let mut stored = doc.clone();
        stored.rev = Some(rev.clone());

        inner.last_seq += 1;
        let seq = inner.last_seq;

        if let Some(old) = inner.projects.get(&doc.doc_id) {
            let old_seq = old.seq;
            inner.feed.remove(&old_seq);
        }
        inner.feed.insert(seq, doc.doc_id.clone());
        inner.projects.insert(
            doc.doc_id.clone(),
            StoredProject {
                value: stored.to_json(),
                generation,
                seq,
            },
        );

        rev
    }

    fn parse_seq(since: Option<&str>) -> Result<u64> {
        match since {
            None => Ok(0),
            Some(s) => s
                .parse::<u64>()
                .map_err(|_| StorageError::serialization(format!("Invalid sequence token: {}", s))),
        }
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn fetch_project(&self, doc_id: &str) -> Result<Option<ProjectDocument>> {
        self.check_available()?;
        let value = self.raw_project(doc_id);
        value.map(ProjectDocument::from_json).transpose()
    }

    async fn save_project(&self, doc: &ProjectDocument) -> Result<String> {
        self.check_available()?;
        let mut inner = self.inner.lock();

        let current = inner
            .projects
            .get(&doc.doc_id)
            .map(|p| (p.generation, format!("{}-mem", p.generation)));

        let generation = match (current, doc.rev.as_deref()) {
            (None, None) => 1,
            (Some((generation, current_rev)), Some(rev)) if rev == current_rev => generation + 1,
            _ => return Err(StorageError::conflict(&doc.doc_id)),
        };

        let rev = Self::write(&mut inner, doc, generation);
        self.project_saves.fetch_add(1, Ordering::SeqCst);
        Ok(rev)
    }

    async fn changes_since(&self, since: Option<&str>, limit: usize) -> Result<ChangeBatch> {
        self.check_available()?;
        let since_seq = Self::parse_seq(since)?;
        let inner = self.inner.lock();

        let changes: Vec<Change> = inner
            .feed
            .range(since_seq + 1..)
            .take(limit.max(1))
            .map(|(seq, doc_id)| Change {
                doc_id: doc_id.clone(),
                seq: seq.to_string(),
                rev: inner
                    .projects
                    .get(doc_id)
                    .map(|p| format!("{}-mem", p.generation)),
                deleted: false,
            })
            .collect();

        let last_seq = changes
            .last()
            .map(|c| c.seq.clone())
            .or_else(|| since.map(str::to_string));

        Ok(ChangeBatch { changes, last_seq })
    }

    async fn list_in_flight(&self) -> Result<Vec<ProjectDocument>> {
        self.check_available()?;
        let values: Vec<Value> = self
            .inner
            .lock()
            .projects
            .values()
            .map(|p| p.value.clone())
            .collect();

        let mut docs = Vec::new();
        for value in values {
            let doc = ProjectDocument::from_json(value)?;
            if doc.status.is_in_flight() {
                docs.push(doc);
            }
        }
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(docs)
    }

    async fn fetch_status_record(&self, doc_id: &str) -> Result<Option<StatusRecord>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .records
            .get(doc_id)
            .map(|(_, record)| record.clone()))
    }

    async fn save_status_record(&self, record: &StatusRecord) -> Result<String> {
        self.check_available()?;
        let mut inner = self.inner.lock();

        let current = inner
            .records
            .get(&record.doc_id)
            .map(|(g, _)| (*g, format!("{}-mem", g)));

        let generation = match (current, record.rev.as_deref()) {
            (None, None) => 1,
            (Some((generation, current_rev)), Some(rev)) if rev == current_rev => generation + 1,
            _ => return Err(StorageError::conflict(&record.doc_id)),
        };

        let rev = format!("{}-mem", generation);
        let mut stored = record.clone();
        stored.rev = Some(rev.clone());
        inner
            .records
            .insert(record.doc_id.clone(), (generation, stored));
        Ok(rev)
    }

    async fn load_cursor(&self) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.inner.lock().cursor.clone())
    }

    async fn save_cursor(&self, seq: &str) -> Result<()> {
        self.check_available()?;
        self.inner.lock().cursor = Some(seq.to_string());
        Ok(())
    }
}
