use crate::error::Result;
use crate::event::{Event, EventSink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use yggdrasil_storage::{update_status_record_with_retry, ProjectStore};

/// Changes requested per feed page
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Polls the change feed and emits `ProjectChanged` for unhandled revisions
///
/// The cursor is persisted only after every event of a page was delivered,
/// so a shutdown mid-page replays that page on the next start instead of
/// losing it. Replays are harmless: covered revisions are suppressed here and
/// in-flight documents are coalesced by the dispatcher.
pub struct ChangePoller {
    store: Arc<dyn ProjectStore>,
    interval: Duration,
    batch_limit: usize,
}

impl ChangePoller {
    pub fn new(store: Arc<dyn ProjectStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Drain the feed from the stored cursor
    ///
    /// Returns the number of events delivered.
    pub async fn poll_once(&self, sink: &EventSink) -> Result<usize> {
        let mut cursor = self.store.load_cursor().await?;
        let mut delivered = 0;

        loop {
            let batch = self
                .store
                .changes_since(cursor.as_deref(), self.batch_limit)
                .await?;
            let page_len = batch.changes.len();

            for change in batch.changes {
                if change.deleted {
                    debug!("Ignoring deletion of {}", change.doc_id);
                    continue;
                }

                let seen = update_status_record_with_retry(
                    self.store.as_ref(),
                    &change.doc_id,
                    |record| {
                        if record.covers(change.rev.as_deref()) {
                            return false;
                        }
                        if record.rev.is_none() {
                            debug!("First sighting of {}", change.doc_id);
                        }
                        record.last_seq = Some(change.seq.clone());
                        true
                    },
                )
                .await?;

                if seen.is_none() {
                    debug!(
                        "Suppressing {} at {}: already handled",
                        change.doc_id,
                        change.rev.as_deref().unwrap_or("?")
                    );
                    continue;
                }

                if !sink.emit(Event::project(change.doc_id)).await {
                    // Shutting down; cursor stays where it was
                    return Ok(delivered);
                }
                delivered += 1;
            }

            match batch.last_seq {
                Some(seq) if cursor.as_deref() != Some(seq.as_str()) => {
                    self.store.save_cursor(&seq).await?;
                    cursor = Some(seq);
                }
                _ => break,
            }

            if page_len < self.batch_limit {
                break;
            }
        }

        Ok(delivered)
    }

    /// Poll every interval until shutdown
    ///
    /// Store failures are logged and retried on the next tick.
    pub async fn run(self, sink: EventSink) {
        info!("Change poller started (every {:?})", self.interval);
        let shutdown = sink.shutdown_token().clone();

        loop {
            match self.poll_once(&sink).await {
                Ok(0) => {}
                Ok(n) => debug!("Change feed delivered {} event(s)", n),
                Err(e) if e.is_transient_io() => {
                    warn!("Change feed poll failed, retrying next tick: {}", e)
                }
                Err(e) => warn!("Change feed poll failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Change poller stopped");
    }
}
