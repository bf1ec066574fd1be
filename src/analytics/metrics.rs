use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    // Estimators
    Kalman,
    Hmm,
    CompetencyHmm,
    Bayesian,
    BeliefDistribution,
    Irt,
    Attention,
    Meta,
    // Decision
    Pid,
    QLearning,
    // Composition
    Spi,
    Store,
}

impl ComponentId {
    pub fn all() -> &'static [ComponentId] {
        &[
            ComponentId::Kalman,
            ComponentId::Hmm,
            ComponentId::CompetencyHmm,
            ComponentId::Bayesian,
            ComponentId::BeliefDistribution,
            ComponentId::Irt,
            ComponentId::Attention,
            ComponentId::Meta,
            ComponentId::Pid,
            ComponentId::QLearning,
            ComponentId::Spi,
            ComponentId::Store,
        ]
    }

    pub fn id(&self) -> &'static str {
        match self {
            ComponentId::Kalman => "modeling_kalman",
            ComponentId::Hmm => "modeling_hmm",
            ComponentId::CompetencyHmm => "modeling_competency_hmm",
            ComponentId::Bayesian => "modeling_bayesian",
            ComponentId::BeliefDistribution => "modeling_belief_distribution",
            ComponentId::Irt => "modeling_irt",
            ComponentId::Attention => "modeling_attention",
            ComponentId::Meta => "modeling_meta",
            ComponentId::Pid => "decision_pid",
            ComponentId::QLearning => "decision_qlearning",
            ComponentId::Spi => "composition_spi",
            ComponentId::Store => "io_store",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComponentId::Kalman => "Kalman Smoother",
            ComponentId::Hmm => "Learning-State HMM",
            ComponentId::CompetencyHmm => "Competency HMM",
            ComponentId::Bayesian => "Bayesian Mastery Tracker",
            ComponentId::BeliefDistribution => "Mastery Distribution",
            ComponentId::Irt => "Item Response Theory",
            ComponentId::Attention => "Attention Focus Scorer",
            ComponentId::Meta => "Meta Learner",
            ComponentId::Pid => "PID Difficulty Controller",
            ComponentId::QLearning => "Q-Learning Policy",
            ComponentId::Spi => "SPI Composer",
            ComponentId::Store => "Model Store",
        }
    }

    pub fn layer(&self) -> &'static str {
        match self {
            ComponentId::Kalman
            | ComponentId::Hmm
            | ComponentId::CompetencyHmm
            | ComponentId::Bayesian
            | ComponentId::BeliefDistribution
            | ComponentId::Irt
            | ComponentId::Attention
            | ComponentId::Meta => "modeling",
            ComponentId::Pid | ComponentId::QLearning => "decision",
            ComponentId::Spi => "composition",
            ComponentId::Store => "io",
        }
    }
}

impl FromStr for ComponentId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentId::all()
            .iter()
            .copied()
            .find(|id| id.id() == s || id.id().split_once('_').map(|(_, short)| short) == Some(s))
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentMetricsSnapshot {
    pub call_count: u64,
    pub total_latency_us: u64,
    pub error_count: u64,
    pub last_called_at: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ComponentMetrics {
    call_count: AtomicU64,
    total_latency_us: AtomicU64,
    error_count: AtomicU64,
    last_called_at: AtomicU64,
}

impl ComponentMetrics {
    pub fn record_call(&self, latency_us: u64) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        self.last_called_at.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let calls = self.call_count.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        let avg = (total_us as f64 / calls as f64) / 1000.0;
        (avg * 10000.0).round() / 10000.0
    }

    pub fn last_called_at(&self) -> Option<u64> {
        match self.last_called_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn snapshot(&self) -> ComponentMetricsSnapshot {
        ComponentMetricsSnapshot {
            call_count: self.call_count(),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
            error_count: self.error_count(),
            last_called_at: self.last_called_at(),
        }
    }
}

/// Per-engine call counters; one entry per [`ComponentId`].
pub struct ComponentRegistry {
    metrics: HashMap<ComponentId, ComponentMetrics>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        let metrics = ComponentId::all()
            .iter()
            .map(|id| (*id, ComponentMetrics::default()))
            .collect();
        Self { metrics }
    }

    pub fn record(&self, id: ComponentId, latency_us: u64) {
        if let Some(m) = self.metrics.get(&id) {
            m.record_call(latency_us);
        }
    }

    pub fn record_error(&self, id: ComponentId) {
        if let Some(m) = self.metrics.get(&id) {
            m.record_error();
        }
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentMetrics> {
        self.metrics.get(&id)
    }

    pub fn snapshot(&self) -> Vec<ComponentStatus> {
        ComponentId::all()
            .iter()
            .filter_map(|id| self.metrics.get(id).map(|m| (id, m)))
            .map(|(id, m)| {
                let calls = m.call_count();
                let errors = m.error_count();
                let status = if calls == 0 && errors == 0 {
                    "idle"
                } else if errors > calls / 2 {
                    "degraded"
                } else {
                    "healthy"
                };
                ComponentStatus {
                    id: id.id().to_string(),
                    name: id.name().to_string(),
                    layer: id.layer().to_string(),
                    call_count: calls,
                    avg_latency_ms: m.avg_latency_ms(),
                    error_count: errors,
                    last_called_at: m.last_called_at(),
                    status: status.to_string(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub id: String,
    pub name: String,
    pub layer: String,
    pub call_count: u64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub last_called_at: Option<u64>,
    pub status: String,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[macro_export]
macro_rules! track_component {
    ($registry:expr, $id:expr, $body:expr) => {{
        let start = std::time::Instant::now();
        let result = $body;
        let latency_us = start.elapsed().as_micros() as u64;
        $registry.record($id, latency_us);
        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_round_trip() {
        for id in ComponentId::all() {
            assert_eq!(id.id().parse::<ComponentId>(), Ok(*id));
        }
        assert_eq!("kalman".parse::<ComponentId>(), Ok(ComponentId::Kalman));
        assert!("nope".parse::<ComponentId>().is_err());
    }

    #[test]
    fn test_track_component_records_call() {
        let registry = ComponentRegistry::new();
        let value = track_component!(registry, ComponentId::Pid, 40 + 2);
        assert_eq!(value, 42);
        let m = registry.get(ComponentId::Pid).unwrap();
        assert_eq!(m.call_count(), 1);
        assert!(m.last_called_at().is_some());
    }

    #[test]
    fn test_snapshot_status() {
        let registry = ComponentRegistry::new();
        registry.record(ComponentId::Kalman, 10);
        registry.record_error(ComponentId::Store);
        let snapshot = registry.snapshot();
        let status = |id: &str| {
            snapshot
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.status.clone())
                .unwrap()
        };
        assert_eq!(status("modeling_kalman"), "healthy");
        assert_eq!(status("io_store"), "degraded");
        assert_eq!(status("decision_pid"), "idle");
    }
}
