//! CouchDB adapter for `ProjectStore`
//!
//! Talks to the CouchDB HTTP API with `reqwest`:
//!
//! - `GET/PUT /{db}/{id}` for documents (409 → `Conflict`)
//! - `GET /{db}/_changes?since=&limit=` for the change feed
//! - `POST /{db}/_find` (paged by bookmark) for the in-flight scan
//!
//! Status records and the change-feed cursor live in a separate database.
//! Status records are saved against the `_rev` they were read at; the cursor
//! has a single writer and is upserted over its current `_rev`.

use crate::domain::{
    seq_to_string, Change, ChangeBatch, ProjectDocument, ProjectStatus, ProjectStore,
    StatusRecord, CURSOR_DOC_ID, MAX_CONFLICT_RETRIES,
};
use crate::{Result, StorageError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const FIND_PAGE_SIZE: usize = 200;

/// Connection settings for `CouchDbStore`
#[derive(Debug, Clone)]
pub struct CouchDbConfig {
    /// Base URL, e.g. `http://localhost:5984`
    pub url: String,
    pub project_db: String,
    pub status_db: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl CouchDbConfig {
    pub fn new(
        url: impl Into<String>,
        project_db: impl Into<String>,
        status_db: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            project_db: project_db.into(),
            status_db: status_db.into(),
            user: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }
}

/// `ProjectStore` backed by a CouchDB server
pub struct CouchDbStore {
    client: Client,
    base: Url,
    config: CouchDbConfig,
}

impl CouchDbStore {
    pub fn new(config: CouchDbConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| StorageError::config(format!("Invalid CouchDB URL '{}': {}", config.url, e)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Create both databases if they do not exist yet
    pub async fn ensure_databases(&self) -> Result<()> {
        for db in [self.config.project_db.as_str(), self.config.status_db.as_str()] {
            let url = self.url(&[db])?;
            let response = self.auth(self.client.get(url.clone())).send().await?;

            if response.status() == StatusCode::NOT_FOUND {
                let created = self.auth(self.client.put(url)).send().await?;
                // 412: created concurrently by another process
                if !created.status().is_success()
                    && created.status() != StatusCode::PRECONDITION_FAILED
                {
                    return Err(Self::unexpected(created).await);
                }
                info!("Created CouchDB database '{}'", db);
            } else if !response.status().is_success() {
                return Err(Self::unexpected(response).await);
            }
        }
        Ok(())
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::config(format!("CouchDB URL cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.user {
            Some(user) => request.basic_auth(user, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn unexpected(response: reqwest::Response) -> StorageError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        StorageError::http(status.as_u16(), format!("CouchDB error ({}): {}", status, body))
    }

    async fn get_doc(&self, db: &str, id: &str) -> Result<Option<Value>> {
        let url = self.url(&[db, id])?;
        let response = self.auth(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn put_doc(&self, db: &str, id: &str, body: &Value) -> Result<String> {
        let url = self.url(&[db, id])?;
        let response = self.auth(self.client.put(url).json(body)).send().await?;

        match response.status() {
            StatusCode::CONFLICT => Err(StorageError::conflict(id).with_status(409)),
            s if s.is_success() => {
                let reply: Value = response.json().await?;
                reply
                    .get("rev")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| StorageError::serialization("CouchDB write reply has no `rev`"))
            }
            _ => Err(Self::unexpected(response).await),
        }
    }

    /// Write the cursor document, taking over whatever revision is current
    async fn upsert(&self, id: &str, mut body: Value) -> Result<()> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current_rev = self
                .get_doc(&self.config.status_db, id)
                .await?
                .and_then(|doc| doc.get("_rev").cloned());

            if let Value::Object(map) = &mut body {
                match &current_rev {
                    Some(rev) => map.insert("_rev".to_string(), rev.clone()),
                    None => map.remove("_rev"),
                };
            }

            match self.put_doc(&self.config.status_db, id, &body).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => debug!("Conflict upserting {}, retrying", id),
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::conflict(id))
    }
}

/// Decode a `_changes` reply, dropping design documents
pub(crate) fn parse_changes(reply: &Value) -> Result<ChangeBatch> {
    let results = reply
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| StorageError::serialization("_changes reply has no `results`"))?;

    let mut changes = Vec::with_capacity(results.len());
    for row in results {
        let doc_id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.starts_with("_design/") => id.to_string(),
            _ => continue,
        };
        let seq = row
            .get("seq")
            .and_then(seq_to_string)
            .ok_or_else(|| StorageError::serialization(format!("change for {} has no seq", doc_id)))?;
        let rev = row
            .get("changes")
            .and_then(Value::as_array)
            .and_then(|revs| revs.first())
            .and_then(|r| r.get("rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let deleted = row.get("deleted").and_then(Value::as_bool).unwrap_or(false);

        changes.push(Change {
            doc_id,
            seq,
            rev,
            deleted,
        });
    }

    Ok(ChangeBatch {
        changes,
        last_seq: reply.get("last_seq").and_then(seq_to_string),
    })
}

#[async_trait]
impl ProjectStore for CouchDbStore {
    async fn fetch_project(&self, doc_id: &str) -> Result<Option<ProjectDocument>> {
        self.get_doc(&self.config.project_db, doc_id)
            .await?
            .map(ProjectDocument::from_json)
            .transpose()
    }

    async fn save_project(&self, doc: &ProjectDocument) -> Result<String> {
        self.put_doc(&self.config.project_db, &doc.doc_id, &doc.to_json())
            .await
    }

    async fn changes_since(&self, since: Option<&str>, limit: usize) -> Result<ChangeBatch> {
        let mut url = self.url(&[self.config.project_db.as_str(), "_changes"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.max(1).to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }

        let response = self.auth(self.client.get(url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }
        let reply: Value = response.json().await?;
        parse_changes(&reply)
    }

    async fn list_in_flight(&self) -> Result<Vec<ProjectDocument>> {
        let url = self.url(&[self.config.project_db.as_str(), "_find"])?;
        let statuses: Vec<&str> = ProjectStatus::IN_FLIGHT.iter().map(|s| s.as_str()).collect();

        let mut docs = Vec::new();
        let mut bookmark: Option<String> = None;
        loop {
            let mut query = json!({
                "selector": {"status": {"$in": statuses}},
                "limit": FIND_PAGE_SIZE,
            });
            if let Some(mark) = &bookmark {
                query["bookmark"] = Value::String(mark.clone());
            }

            let response = self
                .auth(self.client.post(url.clone()).json(&query))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(Self::unexpected(response).await);
            }
            let reply: Value = response.json().await?;

            let page = reply
                .get("docs")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = page.len();
            for raw in page {
                docs.push(ProjectDocument::from_json(raw)?);
            }

            bookmark = reply
                .get("bookmark")
                .and_then(Value::as_str)
                .map(str::to_string);
            if page_len < FIND_PAGE_SIZE || bookmark.is_none() {
                break;
            }
        }

        Ok(docs)
    }

    async fn fetch_status_record(&self, doc_id: &str) -> Result<Option<StatusRecord>> {
        match self.get_doc(&self.config.status_db, doc_id).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    async fn save_status_record(&self, record: &StatusRecord) -> Result<String> {
        let body = serde_json::to_value(record)?;
        self.put_doc(&self.config.status_db, &record.doc_id, &body)
            .await
    }

    async fn load_cursor(&self) -> Result<Option<String>> {
        Ok(self
            .get_doc(&self.config.status_db, CURSOR_DOC_ID)
            .await?
            .and_then(|doc| doc.get("last_seq").and_then(seq_to_string)))
    }

    async fn save_cursor(&self, seq: &str) -> Result<()> {
        let body = json!({"_id": CURSOR_DOC_ID, "last_seq": seq});
        self.upsert(CURSOR_DOC_ID, body).await
    }
}
