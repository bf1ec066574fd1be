use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::analytics::error::ConfigError;
use crate::analytics::types::AssessmentObservation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub dimension: usize,
    pub temperature: f64,
    pub min_weight: f64,
    pub head_temperatures: Vec<f64>,
    pub adaptation_rate: f64,
    pub query_weights: BTreeMap<String, f64>,
    pub default_query_weight: f64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        let query_weights = [
            ("score", 1.0),
            ("difficulty", 0.8),
            ("time_taken", 0.5),
            ("competency", 0.7),
            ("hour", 0.3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            dimension: 16,
            temperature: 1.0,
            min_weight: 0.01,
            head_temperatures: vec![0.5, 1.0, 2.0],
            adaptation_rate: 0.05,
            query_weights,
            default_query_weight: 0.5,
        }
    }
}

impl AttentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::invalid("attention.dimension", "must be > 0"));
        }
        if !(self.temperature > 0.0) || self.head_temperatures.iter().any(|t| !(*t > 0.0)) {
            return Err(ConfigError::invalid(
                "attention.temperature",
                "temperatures must be > 0",
            ));
        }
        if !(0.0..1.0).contains(&self.min_weight) {
            return Err(ConfigError::invalid("attention.min_weight", "must lie in [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Number(f64),
    Text(String),
}

impl ContextValue {
    /// Numbers are read as percentages, strings by length.
    pub fn normalized(&self) -> f64 {
        match self {
            Self::Number(n) if n.is_finite() => (n / 100.0).clamp(0.0, 1.0),
            Self::Number(_) => 0.0,
            Self::Text(s) => (s.chars().count() as f64 / 32.0).min(1.0),
        }
    }
}

pub type AttentionContext = BTreeMap<String, ContextValue>;

pub fn context_from_observation(observation: &AssessmentObservation) -> AttentionContext {
    let mut context = AttentionContext::new();
    context.insert(
        "difficulty".into(),
        ContextValue::Number(observation.difficulty().index() as f64 * 25.0),
    );
    context.insert(
        "time_taken".into(),
        ContextValue::Number((observation.time_taken / 60.0).max(0.0)),
    );
    context.insert(
        "hour".into(),
        ContextValue::Number(observation.hour_of_day() as f64),
    );
    if let Some(first) = observation.concepts().into_iter().next() {
        context.insert("competency".into(), ContextValue::Text(first));
    }
    context
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub context: AttentionContext,
    pub values: BTreeMap<String, f64>,
}

impl HistoricalRecord {
    pub fn from_observation(observation: &AssessmentObservation) -> Self {
        let mut values = BTreeMap::new();
        values.insert("score".to_string(), observation.clamped_score());
        if observation.time_taken.is_finite() && observation.time_taken > 0.0 {
            values.insert("time_taken".to_string(), observation.time_taken);
        }
        Self {
            context: context_from_observation(observation),
            values,
        }
    }
}

/// Per-student embeddings, persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttentionModel {
    pub embeddings: BTreeMap<String, Vec<f64>>,
    pub adaptations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionOutput {
    pub weights: Vec<f64>,
    pub values: BTreeMap<String, f64>,
    pub focus_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionStatistics {
    pub dimensions: Vec<String>,
    pub adaptations: u32,
}

pub struct AttentionFocusScorer {
    config: AttentionConfig,
}

impl Default for AttentionFocusScorer {
    fn default() -> Self {
        Self::new(AttentionConfig::default())
    }
}

impl AttentionFocusScorer {
    pub fn new(config: AttentionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Deterministic unit embedding derived from the dimension name.
    pub fn seeded_embedding(&self, name: &str) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(fnv1a(name));
        let raw: Vec<f64> = (0..self.config.dimension)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        l2_normalize(raw)
    }

    pub fn embedding(&self, model: &AttentionModel, name: &str) -> Vec<f64> {
        match model.embeddings.get(name) {
            Some(e) if e.len() == self.config.dimension => e.clone(),
            _ => self.seeded_embedding(name),
        }
    }

    pub fn encode(&self, model: &AttentionModel, context: &AttentionContext) -> Vec<f64> {
        let mut vector = vec![0.0; self.config.dimension];
        for (name, value) in context {
            let weight = self
                .config
                .query_weights
                .get(name)
                .copied()
                .unwrap_or(self.config.default_query_weight);
            let scale = weight * value.normalized();
            if scale == 0.0 {
                continue;
            }
            for (slot, e) in vector.iter_mut().zip(self.embedding(model, name)) {
                *slot += scale * e;
            }
        }
        l2_normalize(vector)
    }

    pub fn score(query: &[f64], key: &[f64]) -> f64 {
        query.iter().zip(key).map(|(q, k)| q * k).sum()
    }

    /// Softmax at `temperature`; weights under the minimum are zeroed and the rest renormalized.
    pub fn softmax(&self, scores: &[f64], temperature: f64) -> Vec<f64> {
        if scores.is_empty() {
            return Vec::new();
        }
        let t = temperature.max(1e-6);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| ((s - max) / t).exp()).collect();
        let total: f64 = exps.iter().sum();

        let mut weights: Vec<f64> = exps
            .iter()
            .map(|e| e / total)
            .map(|w| if w < self.config.min_weight { 0.0 } else { w })
            .collect();
        let kept: f64 = weights.iter().sum();
        if kept > 0.0 {
            weights.iter_mut().for_each(|w| *w /= kept);
        } else {
            let best = argmax(scores);
            weights = vec![0.0; scores.len()];
            weights[best] = 1.0;
        }
        weights
    }

    pub fn multi_head(&self, scores: &[f64]) -> Vec<f64> {
        if self.config.head_temperatures.is_empty() {
            return self.softmax(scores, self.config.temperature);
        }
        let mut combined = vec![0.0; scores.len()];
        for multiplier in &self.config.head_temperatures {
            let head = self.softmax(scores, self.config.temperature * multiplier);
            for (c, w) in combined.iter_mut().zip(head) {
                *c += w;
            }
        }
        let total: f64 = combined.iter().sum();
        if total > 0.0 {
            combined.iter_mut().for_each(|w| *w /= total);
        }
        combined
    }

    pub fn attend(
        &self,
        model: &AttentionModel,
        query: &AttentionContext,
        history: &[HistoricalRecord],
    ) -> Option<AttentionOutput> {
        if history.is_empty() {
            return None;
        }
        let q = self.encode(model, query);
        let scores: Vec<f64> = history
            .iter()
            .map(|record| Self::score(&q, &self.encode(model, &record.context)))
            .collect();
        let weights = self.multi_head(&scores);

        let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for (record, w) in history.iter().zip(&weights) {
            for (key, value) in &record.values {
                if !value.is_finite() {
                    continue;
                }
                let entry = sums.entry(key.clone()).or_insert((0.0, 0.0));
                entry.0 += w * value;
                entry.1 += w;
            }
        }
        let values = sums
            .into_iter()
            .filter(|(_, (_, mass))| *mass > 0.0)
            .map(|(key, (sum, mass))| (key, sum / mass))
            .collect();

        Some(AttentionOutput {
            focus_index: argmax(&weights),
            weights,
            values,
        })
    }

    /// Reward-scaled random perturbation of the embeddings the context touches.
    pub fn adapt<R: Rng>(
        &self,
        model: &mut AttentionModel,
        context: &AttentionContext,
        reward: f64,
        rng: &mut R,
    ) {
        if !reward.is_finite() {
            return;
        }
        let step = self.config.adaptation_rate * reward.clamp(-1.0, 1.0);
        for name in context.keys() {
            let current = self.embedding(model, name);
            let perturbed: Vec<f64> = current
                .into_iter()
                .map(|e| e + step * rng.random_range(-1.0..1.0))
                .collect();
            model.embeddings.insert(name.clone(), l2_normalize(perturbed));
        }
        model.adaptations = model.adaptations.saturating_add(1);
    }

    pub fn statistics(&self, model: &AttentionModel) -> AttentionStatistics {
        AttentionStatistics {
            dimensions: model.embeddings.keys().cloned().collect(),
            adaptations: model.adaptations,
        }
    }
}

fn l2_normalize(mut v: Vec<f64>) -> Vec<f64> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (idx, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = idx;
        }
    }
    best
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
