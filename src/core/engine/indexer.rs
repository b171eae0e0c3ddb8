//! Full indexer
//!
//! Pages through a source table in stable key order and replaces the
//! snapshot only once every page has arrived. A failed page leaves the
//! previous snapshot in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{reduce, Delta, Phase, SourceEngine};
use crate::core::record::{IndexedRecord, SourceSnapshot};
use crate::core::remote::{ChangeNotification, PageRequest, RemoteError};
use crate::core::source::SourceConfig;

/// Errors aborting a full index run
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Failed to count rows in '{table}': {source}")]
    Count { table: String, source: RemoteError },

    #[error("Failed to fetch page at offset {offset} of '{table}': {source}")]
    Page {
        table: String,
        offset: usize,
        source: RemoteError,
    },
}

/// Result of a full index request
#[derive(Debug)]
pub enum IndexOutcome {
    Indexed { records: usize },
    /// Another run for the same source was already in flight
    AlreadyRunning,
    Failed(IndexError),
}

impl IndexOutcome {
    pub fn is_indexed(&self) -> bool {
        matches!(self, IndexOutcome::Indexed { .. })
    }
}

/// Fold changes delivered during a run onto the rows it fetched
///
/// The reducer is keyed on primary keys, so a change the pages already
/// reflect is applied again without effect.
fn replay(
    config: &SourceConfig,
    mut records: Vec<IndexedRecord>,
    queued: &[ChangeNotification],
) -> Vec<IndexedRecord> {
    for change in queued {
        if let Ok(Delta::Changed(next)) = reduce(config, &records, change) {
            records = next;
        }
    }
    records
}

/// Holds the in-flight flag for the duration of one run
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SourceEngine {
    /// Fetch every row of the source and publish a complete snapshot
    pub async fn index_all(&self) -> IndexOutcome {
        let Some(_guard) = InFlight::acquire(&self.indexing) else {
            debug!(source = self.name(), "index already running");
            return IndexOutcome::AlreadyRunning;
        };

        self.queued().clear();
        self.state.send_modify(|s| {
            s.phase = Phase::Indexing;
            s.is_indexing = true;
            s.progress = 0;
            s.total = 0;
            s.error = None;
        });

        match self.fetch_all().await {
            Ok(records) => {
                let mut count = 0;
                let mut replayed = 0;
                self.state.send_modify(|s| {
                    let queued = std::mem::take(&mut *self.queued());
                    replayed = queued.len();
                    let records = replay(&self.config, records, &queued);
                    count = records.len();

                    let snapshot = SourceSnapshot::complete(records, Utc::now());
                    self.cache.write(self.name(), &snapshot);

                    s.last_updated = Some(snapshot.timestamp);
                    s.data = Arc::new(snapshot);
                    s.phase = Phase::Ready;
                    s.is_indexing = false;
                    s.is_complete = true;
                    s.total = s.total.max(s.progress);
                });
                info!(source = self.name(), records = count, replayed, "index complete");
                IndexOutcome::Indexed { records: count }
            }
            Err(e) => {
                warn!(source = self.name(), error = %e, "index failed; keeping previous snapshot");
                let message = e.to_string();
                // Queued changes are already folded into the snapshot being kept
                self.queued().clear();
                self.state.send_modify(|s| {
                    s.is_indexing = false;
                    s.phase = if s.data.complete {
                        Phase::Ready
                    } else {
                        Phase::Uninitialized
                    };
                    s.error = Some(message);
                });
                IndexOutcome::Failed(e)
            }
        }
    }

    async fn fetch_all(&self) -> Result<Vec<IndexedRecord>, IndexError> {
        let table = self.config.table.as_str();
        let clause = self.config.exclude_clause();

        let total = self
            .remote
            .count(table, clause.as_ref())
            .await
            .map_err(|source| IndexError::Count {
                table: table.to_string(),
                source,
            })?;
        self.state.send_modify(|s| s.total = total);

        let mut records = Vec::with_capacity(total);
        let mut offset = 0;

        loop {
            let page = self
                .remote
                .fetch_page(PageRequest {
                    table,
                    filter: clause.as_ref(),
                    order_by: &self.config.fields.primary_key,
                    offset,
                    limit: self.page_size,
                })
                .await
                .map_err(|source| IndexError::Page {
                    table: table.to_string(),
                    offset,
                    source,
                })?;

            let fetched = page.len();
            for row in &page {
                match self.config.decode(row) {
                    Ok(record) if self.config.index_rule.matches(&record) => records.push(record),
                    Ok(_) => {}
                    Err(e) => warn!(source = self.name(), error = %e, "skipping undecodable row"),
                }
            }

            offset += fetched;
            self.state.send_modify(|s| {
                s.progress = offset;
                // Rows committed after the count can push progress past the estimate
                s.total = s.total.max(offset);
            });
            debug!(source = self.name(), offset, total, "page fetched");

            if fetched < self.page_size {
                break;
            }
        }

        Ok(records)
    }
}
