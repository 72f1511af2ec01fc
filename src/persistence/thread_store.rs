//! On-disk thread record store.
//!
//! Persists `{threads: {threadId: record}}` as a single pretty-printed JSON
//! file. Writers are serialized by construction: all mutations arrive
//! through the per-thread queue, so a single in-process lock suffices and
//! no lock is ever held across the file write's suspension point in a way
//! that blocks other thread ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::thread::ThreadRecord;
use crate::{AppError, Result};

/// Serialized shape of the store file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    threads: HashMap<String, ThreadRecord>,
}

/// Thread record store backed by one JSON file.
#[derive(Debug)]
pub struct ThreadStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, ThreadRecord>>,
}

impl ThreadStore {
    /// Create a store over `path` without touching the filesystem yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Load the store, creating the parent directory and an empty file when
    /// absent. A corrupt file is reset to empty and rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the directory or file cannot be
    /// created or read.
    pub async fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Store(format!("failed to create store dir: {e}")))?;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => {
                    let mut inner = self.inner.lock().await;
                    *inner = file.threads;
                    debug!(path = %self.path.display(), count = inner.len(), "thread store loaded");
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "thread store corrupt, resetting to empty"
                    );
                    self.persist(&HashMap::new()).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.persist(&HashMap::new()).await?;
            }
            Err(e) => {
                return Err(AppError::Store(format!("failed to read store: {e}")));
            }
        }

        Ok(())
    }

    /// Fetch one record by thread id.
    pub async fn get(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.inner.lock().await.get(thread_id).cloned()
    }

    /// All records sorted by `updatedAt` descending.
    pub async fn list(&self) -> Vec<ThreadRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<ThreadRecord> = inner.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// Insert or replace a record and persist the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the file write fails; the in-memory
    /// map keeps the new record either way.
    pub async fn upsert(&self, record: ThreadRecord) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            inner.insert(record.thread_id.clone(), record);
            inner.clone()
        };
        self.persist(&snapshot).await
    }

    /// Path the store persists to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `threads` to disk, pretty-printed for inspection.
    async fn persist(&self, threads: &HashMap<String, ThreadRecord>) -> Result<()> {
        let file = StoreFile {
            threads: threads.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AppError::Store(format!("failed to serialize store: {e}")))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| AppError::Store(format!("failed to write store: {e}")))
    }
}
