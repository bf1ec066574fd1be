//! Keyed storage seams.
//!
//! [`AssessmentStore`] is the read-only source of evaluated assessments.
//! [`ModelStore`] holds one independently versioned record per
//! `(student, kind, scope)` plus the append-only SPI history. The in-memory
//! implementations back the replay binary and the tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::analytics::error::StoreError;
use crate::analytics::types::{AssessmentObservation, SpiHistoryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Kalman,
    Hmm,
    CompetencyHmm,
    Belief,
    BeliefDistribution,
    Pid,
    Qtable,
    Meta,
    Irt,
    Attention,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kalman => "kalman",
            Self::Hmm => "hmm",
            Self::CompetencyHmm => "competency_hmm",
            Self::Belief => "belief",
            Self::BeliefDistribution => "belief_distribution",
            Self::Pid => "pid",
            Self::Qtable => "qtable",
            Self::Meta => "meta",
            Self::Irt => "irt",
            Self::Attention => "attention",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub student_id: String,
    pub kind: ModelKind,
    /// Competency for competency-aware records.
    pub scope: Option<String>,
}

impl ModelKey {
    pub fn new(student_id: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            student_id: student_id.into(),
            kind,
            scope: None,
        }
    }

    pub fn scoped(student_id: impl Into<String>, kind: ModelKind, scope: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            kind,
            scope: Some(scope.into()),
        }
    }

    pub fn record_id(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{}:{}:{}", self.student_id, self.kind, scope),
            None => format!("{}:{}", self.student_id, self.kind),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    pub id: String,
    pub student_id: String,
    pub kind: ModelKind,
    pub scope: Option<String>,
    pub parameters: serde_json::Value,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait AssessmentStore: Send + Sync {
    /// Evaluated assessments oldest first; `limit` keeps the most recent ones.
    fn recent_assessments(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<AssessmentObservation>, StoreError>> + Send;
}

pub trait ModelStore: Send + Sync {
    fn get(
        &self,
        key: &ModelKey,
    ) -> impl Future<Output = Result<Option<StoredModel>, StoreError>> + Send;

    /// Upsert guarded by the version the caller read; `None` expects no record.
    fn put(
        &self,
        key: &ModelKey,
        parameters: serde_json::Value,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<StoredModel, StoreError>> + Send;

    fn delete(&self, key: &ModelKey) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// All records of one kind for a student, any scope.
    fn list(
        &self,
        student_id: &str,
        kind: ModelKind,
    ) -> impl Future<Output = Result<Vec<StoredModel>, StoreError>> + Send;

    fn append_spi_history(
        &self,
        entry: SpiHistoryEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Oldest first; `limit` keeps the most recent entries.
    fn spi_history(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<SpiHistoryEntry>, StoreError>> + Send;
}

fn tail<T: Clone>(items: &[T], limit: Option<usize>) -> Vec<T> {
    let skip = limit.map_or(0, |n| items.len().saturating_sub(n));
    items[skip..].to_vec()
}

#[derive(Default)]
pub struct InMemoryAssessmentStore {
    assessments: RwLock<HashMap<String, Vec<AssessmentObservation>>>,
}

impl InMemoryAssessmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts keeping time order; equal timestamps keep arrival order.
    pub fn insert(&self, observation: AssessmentObservation) {
        let mut guard = self.assessments.write();
        let list = guard.entry(observation.student_id.clone()).or_default();
        let pos = list.partition_point(|o| o.timestamp <= observation.timestamp);
        list.insert(pos, observation);
    }

    pub fn len(&self, student_id: &str) -> usize {
        self.assessments
            .read()
            .get(student_id)
            .map_or(0, Vec::len)
    }
}

impl AssessmentStore for InMemoryAssessmentStore {
    async fn recent_assessments(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AssessmentObservation>, StoreError> {
        let guard = self.assessments.read();
        Ok(guard
            .get(student_id)
            .map(|list| tail(list, limit))
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryModelStore {
    models: RwLock<HashMap<ModelKey, StoredModel>>,
    history: RwLock<HashMap<String, Vec<SpiHistoryEntry>>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> usize {
        self.models.read().len()
    }
}

impl ModelStore for InMemoryModelStore {
    async fn get(&self, key: &ModelKey) -> Result<Option<StoredModel>, StoreError> {
        Ok(self.models.read().get(key).cloned())
    }

    async fn put(
        &self,
        key: &ModelKey,
        parameters: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<StoredModel, StoreError> {
        let mut guard = self.models.write();
        let now = Utc::now();
        let current = guard.get(key);
        let actual = current.map(|m| m.version);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.record_id(),
                expected: expected_version,
                actual,
            });
        }

        let record = StoredModel {
            id: key.record_id(),
            student_id: key.student_id.clone(),
            kind: key.kind,
            scope: key.scope.clone(),
            parameters,
            version: actual.map_or(1, |v| v + 1),
            created_at: current.map_or(now, |m| m.created_at),
            updated_at: now,
        };
        guard.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, key: &ModelKey) -> Result<bool, StoreError> {
        Ok(self.models.write().remove(key).is_some())
    }

    async fn list(&self, student_id: &str, kind: ModelKind) -> Result<Vec<StoredModel>, StoreError> {
        let guard = self.models.read();
        let mut records: Vec<StoredModel> = guard
            .iter()
            .filter(|(key, _)| key.student_id == student_id && key.kind == kind)
            .map(|(_, model)| model.clone())
            .collect();
        records.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(records)
    }

    async fn append_spi_history(&self, entry: SpiHistoryEntry) -> Result<(), StoreError> {
        self.history
            .write()
            .entry(entry.student_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn spi_history(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SpiHistoryEntry>, StoreError> {
        let guard = self.history.read();
        Ok(guard
            .get(student_id)
            .map(|list| tail(list, limit))
            .unwrap_or_default())
    }
}
