//! Remediation record persistence.
//!
//! Records are audit data: once a record reaches a terminal status the
//! stores refuse any further write to it. The JSONL store appends a full
//! snapshot per write and fsyncs before returning, so a terminal write that
//! returned `Ok` is durable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::RemediationRecord;

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record {0} is terminal and cannot be modified")]
    Immutable(Uuid),

    #[error("record {0} already exists")]
    Duplicate(Uuid),

    #[error("record {0} does not exist")]
    Missing(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for remediation records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, record: &RemediationRecord) -> Result<(), StoreError>;

    /// Replace the stored snapshot. Rejected once the stored copy is terminal.
    async fn update(&self, record: &RemediationRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<RemediationRecord>, StoreError>;

    /// Records for a host, oldest first.
    async fn list_for_host(&self, host_id: &str) -> Result<Vec<RemediationRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Index {
    records: HashMap<Uuid, RemediationRecord>,
    order: Vec<Uuid>,
}

impl Index {
    fn check_create(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        Ok(())
    }

    fn check_update(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        match self.records.get(&record.id) {
            None => Err(StoreError::Missing(record.id)),
            Some(stored) if stored.is_terminal() => Err(StoreError::Immutable(record.id)),
            Some(_) => Ok(()),
        }
    }

    fn put(&mut self, record: RemediationRecord) {
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id);
        }
        self.records.insert(record.id, record);
    }

    fn for_host(&self, host_id: &str) -> Vec<RemediationRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.host_id == host_id)
            .cloned()
            .collect()
    }
}

/// Process-local store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    index: Mutex<Index>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        let mut index = self.lock();
        index.check_create(record)?;
        index.put(record.clone());
        Ok(())
    }

    async fn update(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        let mut index = self.lock();
        index.check_update(record)?;
        index.put(record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RemediationRecord>, StoreError> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn list_for_host(&self, host_id: &str) -> Result<Vec<RemediationRecord>, StoreError> {
        Ok(self.lock().for_host(host_id))
    }
}

/// Append-only JSON Lines file; the latest snapshot per id wins on replay.
pub struct JsonlRecordStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    index: Mutex<Index>,
}

impl JsonlRecordStore {
    /// Open (creating if needed) and replay `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut index = Index::default();
        let mut torn_tail = false;

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RemediationRecord>(line) {
                        Ok(record) => index.put(record),
                        // A torn final write is expected after a crash
                        Err(e) => warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping unreadable record line"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(path = %path.display(), records = index.records.len(), "Opened record store");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if torn_tail {
            // Terminate the partial line so the next append starts clean
            file.write_all(b"\n").await?;
            file.sync_data().await?;
        }

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            index: Mutex::new(index),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn append(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn write(
        &self,
        record: &RemediationRecord,
        check: fn(&Index, &RemediationRecord) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        {
            let index = self.lock();
            check(&index, record)?;
        }
        self.append(record).await?;
        // Re-check: a concurrent writer may have committed a terminal snapshot
        let mut index = self.lock();
        if let Some(stored) = index.records.get(&record.id) {
            if stored.is_terminal() && stored != record {
                return Err(StoreError::Immutable(record.id));
            }
        }
        index.put(record.clone());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn create(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        self.write(record, Index::check_create).await
    }

    async fn update(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        self.write(record, Index::check_update).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<RemediationRecord>, StoreError> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn list_for_host(&self, host_id: &str) -> Result<Vec<RemediationRecord>, StoreError> {
        Ok(self.lock().for_host(host_id))
    }
}

/// Backoff schedule for terminal writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

/// Write a terminal snapshot, retrying with exponential backoff.
///
/// Returns the attempt count alongside the last error once retries run out.
pub async fn commit_with_retry(
    store: &dyn RecordStore,
    record: &RemediationRecord,
    policy: RetryPolicy,
) -> Result<(), (u32, StoreError)> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match store.update(record).await {
            Ok(()) => return Ok(()),
            // Retrying cannot fix these
            Err(e @ (StoreError::Immutable(_) | StoreError::Missing(_))) => return Err((attempt, e)),
            Err(e) if attempt >= policy.max_attempts => return Err((attempt, e)),
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Terminal write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
