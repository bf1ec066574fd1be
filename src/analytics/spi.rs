//! Student Performance Index composition.
//!
//! The raw index is a weighted blend of accuracy, consistency and improvement
//! over a window of recent scores. It is smoothed by the Kalman filter and
//! labelled by the HMM; mastery beliefs are attached read-only. A sub-model
//! that could not be loaded degrades to a fallback instead of failing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::error::ConfigError;
use crate::analytics::modeling::{
    HiddenMarkovModel, HmmConfig, HmmState, KalmanConfig, KalmanSmoother, KalmanState,
};
use crate::analytics::types::{LearningState, SpiHistoryEntry};

pub const NO_DATA_STATE: &str = "no_data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiConfig {
    pub accuracy_weight: f64,
    pub consistency_weight: f64,
    pub improvement_weight: f64,
    /// Consistency is `100 - consistency_scale * stdev`.
    pub consistency_scale: f64,
    pub improvement_bound: f64,
    /// Most recent assessments considered.
    pub window: usize,
    pub fallback_state: LearningState,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            accuracy_weight: 0.35,
            consistency_weight: 0.25,
            improvement_weight: 0.15,
            consistency_scale: 2.0,
            improvement_bound: 50.0,
            window: 50,
            fallback_state: LearningState::Learning,
        }
    }
}

impl SpiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            self.accuracy_weight,
            self.consistency_weight,
            self.improvement_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid("spi.weights", "weights must be finite and >= 0"));
        }
        if self.window == 0 {
            return Err(ConfigError::invalid("spi.window", "must be > 0"));
        }
        if !(self.improvement_bound >= 0.0) || !(self.consistency_scale >= 0.0) {
            return Err(ConfigError::invalid(
                "spi.scales",
                "improvement bound and consistency scale must be >= 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpiComponents {
    pub accuracy: f64,
    pub consistency: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiResult {
    pub student_id: String,
    pub spi: f64,
    pub raw_index: f64,
    pub uncertainty: f64,
    pub confidence: f64,
    pub learning_state: String,
    pub next_state: Option<String>,
    pub concept_mastery: BTreeMap<String, f64>,
    pub components: Option<SpiComponents>,
    pub assessment_count: usize,
    /// Sub-models that fell back during this computation.
    pub degraded: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl SpiResult {
    pub fn has_data(&self) -> bool {
        self.assessment_count > 0
    }

    pub fn to_history_entry(&self) -> SpiHistoryEntry {
        SpiHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: self.student_id.clone(),
            spi: self.spi,
            raw_index: self.raw_index,
            uncertainty: self.uncertainty,
            learning_state: self.learning_state.clone(),
            concept_mastery: self.concept_mastery.clone(),
            assessment_count: self.assessment_count,
            recorded_at: self.computed_at,
        }
    }
}

pub struct SpiComposer {
    config: SpiConfig,
    kalman: KalmanSmoother,
    hmm: HiddenMarkovModel,
}

impl Default for SpiComposer {
    fn default() -> Self {
        Self::new(SpiConfig::default(), KalmanConfig::default(), HmmConfig::default())
    }
}

impl SpiComposer {
    pub fn new(config: SpiConfig, kalman: KalmanConfig, hmm: HmmConfig) -> Self {
        Self {
            config,
            kalman: KalmanSmoother::new(kalman),
            hmm: HiddenMarkovModel::new(hmm),
        }
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    pub fn components(&self, scores: &[f64]) -> Option<SpiComponents> {
        let scores: Vec<f64> = scores
            .iter()
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 100.0))
            .collect();
        let (first, last) = (scores.first()?, scores.last()?);

        let n = scores.len() as f64;
        let accuracy = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - accuracy).powi(2)).sum::<f64>() / n;
        let consistency = (100.0 - self.config.consistency_scale * variance.sqrt()).clamp(0.0, 100.0);
        let bound = self.config.improvement_bound;
        let improvement = (last - first).clamp(-bound, bound);

        Some(SpiComponents {
            accuracy,
            consistency,
            improvement,
        })
    }

    pub fn raw_index(&self, components: &SpiComponents) -> f64 {
        self.config.accuracy_weight * components.accuracy
            + self.config.consistency_weight * components.consistency
            + self.config.improvement_weight * components.improvement
    }

    /// `None` for a sub-model means its state could not be loaded.
    pub fn compose(
        &self,
        student_id: &str,
        scores: &[f64],
        kalman: Option<&mut KalmanState>,
        hmm: Option<&mut HmmState>,
        mastery: Option<BTreeMap<String, f64>>,
    ) -> SpiResult {
        let computed_at = Utc::now();
        let initial_uncertainty = self.kalman.uncertainty(&self.kalman.initial_state());

        let Some(components) = self.components(scores) else {
            return SpiResult {
                student_id: student_id.to_string(),
                spi: 0.0,
                raw_index: 0.0,
                uncertainty: initial_uncertainty,
                confidence: 0.0,
                learning_state: NO_DATA_STATE.to_string(),
                next_state: None,
                concept_mastery: BTreeMap::new(),
                components: None,
                assessment_count: 0,
                degraded: Vec::new(),
                computed_at,
            };
        };

        let raw_index = self.raw_index(&components);
        let mut degraded = Vec::new();

        let (spi, uncertainty, confidence) = match kalman {
            Some(state) => {
                let out = self.kalman.update(state, raw_index);
                (out.estimate, out.uncertainty, out.confidence)
            }
            None => {
                degraded.push("kalman".to_string());
                (raw_index, initial_uncertainty, 0.0)
            }
        };

        let (learning_state, next_state) = match hmm {
            Some(state) => {
                let out = self.hmm.observe(state, raw_index);
                (out.state, Some(out.next_state))
            }
            None => {
                degraded.push("hmm".to_string());
                (self.config.fallback_state, None)
            }
        };

        let concept_mastery = mastery.unwrap_or_else(|| {
            degraded.push("belief".to_string());
            BTreeMap::new()
        });

        SpiResult {
            student_id: student_id.to_string(),
            spi,
            raw_index,
            uncertainty,
            confidence,
            learning_state: learning_state.as_str().to_string(),
            next_state: next_state.map(|s| s.as_str().to_string()),
            concept_mastery,
            components: Some(components),
            assessment_count: scores.iter().filter(|s| s.is_finite()).count(),
            degraded,
            computed_at,
        }
    }
}
