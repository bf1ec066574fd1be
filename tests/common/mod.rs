#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use spi_analytics::analytics::store::StoredModel;
use spi_analytics::analytics::{
    AnalyticsConfig, AnalyticsEngine, AssessmentObservation, InMemoryAssessmentStore,
    InMemoryModelStore, ModelKey, ModelKind, ModelStore, SpiHistoryEntry, StoreError,
};

pub type MemoryEngine = AnalyticsEngine<InMemoryAssessmentStore, InMemoryModelStore>;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).unwrap()
}

pub fn observation(student_id: &str, minute: i64, score: f64) -> AssessmentObservation {
    AssessmentObservation::new(student_id, score, base_time() + ChronoDuration::minutes(minute))
        .with_competencies(["algebra"])
}

pub fn memory_engine() -> (MemoryEngine, Arc<InMemoryAssessmentStore>) {
    let assessments = Arc::new(InMemoryAssessmentStore::new());
    let engine = AnalyticsEngine::with_seed(
        AnalyticsConfig::default(),
        Arc::clone(&assessments),
        Arc::new(InMemoryModelStore::new()),
        42,
    )
    .unwrap();
    (engine, assessments)
}

/// Records and feeds one evaluated assessment through the trigger hook.
pub async fn evaluate<M: ModelStore>(
    engine: &AnalyticsEngine<InMemoryAssessmentStore, M>,
    assessments: &InMemoryAssessmentStore,
    observation: AssessmentObservation,
) -> spi_analytics::analytics::SpiResult {
    assessments.insert(observation.clone());
    engine.on_assessment_evaluated(&observation).await.unwrap()
}

/// Every call fails as if the backing database were down.
#[derive(Default)]
pub struct FailingModelStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

impl ModelStore for FailingModelStore {
    async fn get(&self, _key: &ModelKey) -> Result<Option<StoredModel>, StoreError> {
        Err(down())
    }

    async fn put(
        &self,
        _key: &ModelKey,
        _parameters: serde_json::Value,
        _expected_version: Option<u64>,
    ) -> Result<StoredModel, StoreError> {
        Err(down())
    }

    async fn delete(&self, _key: &ModelKey) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn list(&self, _student_id: &str, _kind: ModelKind) -> Result<Vec<StoredModel>, StoreError> {
        Err(down())
    }

    async fn append_spi_history(&self, _entry: SpiHistoryEntry) -> Result<(), StoreError> {
        Err(down())
    }

    async fn spi_history(
        &self,
        _student_id: &str,
        _limit: Option<usize>,
    ) -> Result<Vec<SpiHistoryEntry>, StoreError> {
        Err(down())
    }
}

/// In-memory store whose reads stall for `delay`.
pub struct SlowModelStore {
    pub inner: InMemoryModelStore,
    pub delay: Duration,
}

impl ModelStore for SlowModelStore {
    async fn get(&self, key: &ModelKey) -> Result<Option<StoredModel>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &ModelKey,
        parameters: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<StoredModel, StoreError> {
        self.inner.put(key, parameters, expected_version).await
    }

    async fn delete(&self, key: &ModelKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, student_id: &str, kind: ModelKind) -> Result<Vec<StoredModel>, StoreError> {
        self.inner.list(student_id, kind).await
    }

    async fn append_spi_history(&self, entry: SpiHistoryEntry) -> Result<(), StoreError> {
        self.inner.append_spi_history(entry).await
    }

    async fn spi_history(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SpiHistoryEntry>, StoreError> {
        self.inner.spi_history(student_id, limit).await
    }
}
