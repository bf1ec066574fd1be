use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::analytics::error::StoreError;
use crate::analytics::store::{ModelKey, ModelKind, ModelStore};
use crate::analytics::types::SpiHistoryEntry;

/// A decoded record and the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Option<u64>,
}

/// Typed access to a [`ModelStore`] with a timeout around every call.
pub struct ModelRepository<M> {
    store: Arc<M>,
    timeout: Duration,
}

impl<M: ModelStore> ModelRepository<M> {
    pub fn new(store: Arc<M>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<M> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &ModelKey,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let Some(record) = self.timed(self.store.get(key)).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(record.parameters)?;
        Ok(Some(Versioned {
            value,
            version: Some(record.version),
        }))
    }

    /// Loads a record or initializes it; an undecodable record is replaced but keeps its version.
    pub async fn load_or_init<T, F>(&self, key: &ModelKey, init: F) -> Result<Versioned<T>, StoreError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        let Some(record) = self.timed(self.store.get(key)).await? else {
            return Ok(Versioned {
                value: init(),
                version: None,
            });
        };
        match serde_json::from_value(record.parameters) {
            Ok(value) => Ok(Versioned {
                value,
                version: Some(record.version),
            }),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "discarding undecodable model record");
                Ok(Versioned {
                    value: init(),
                    version: Some(record.version),
                })
            }
        }
    }

    /// Returns the new version.
    pub async fn save<T: Serialize>(
        &self,
        key: &ModelKey,
        value: &T,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let parameters = serde_json::to_value(value)?;
        let record = self
            .timed(self.store.put(key, parameters, expected_version))
            .await?;
        tracing::debug!(key = %key, version = record.version, "model saved");
        Ok(record.version)
    }

    pub async fn delete(&self, key: &ModelKey) -> Result<bool, StoreError> {
        self.timed(self.store.delete(key)).await
    }

    /// Decoded records of one kind keyed by scope; undecodable ones are skipped.
    pub async fn list<T: DeserializeOwned>(
        &self,
        student_id: &str,
        kind: ModelKind,
    ) -> Result<Vec<(Option<String>, T)>, StoreError> {
        let records = self.timed(self.store.list(student_id, kind)).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let scope = record.scope.clone();
                match serde_json::from_value(record.parameters) {
                    Ok(value) => Some((scope, value)),
                    Err(err) => {
                        tracing::warn!(id = %record.id, error = %err, "skipping undecodable model record");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn append_history(&self, entry: SpiHistoryEntry) -> Result<(), StoreError> {
        self.timed(self.store.append_spi_history(entry)).await
    }

    pub async fn history(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SpiHistoryEntry>, StoreError> {
        self.timed(self.store.spi_history(student_id, limit)).await
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        with_timeout(self.timeout, fut).await
    }
}

pub async fn with_timeout<F, T>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Per-student async mutexes serializing read-modify-write sequences.
pub struct StudentLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    prune_threshold: usize,
}

impl StudentLocks {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            locks: parking_lot::Mutex::new(HashMap::new()),
            prune_threshold,
        }
    }

    pub async fn acquire(&self, student_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock();
            if map.len() >= self.prune_threshold {
                // Only the table itself references idle entries.
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(map.entry(student_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl Default for StudentLocks {
    fn default() -> Self {
        Self::new(1024)
    }
}
