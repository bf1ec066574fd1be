use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::analytics::error::ConfigError;
use crate::analytics::types::AssessmentObservation;

pub const FEATURE_COUNT: usize = 5;
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] =
    ["difficulty", "time", "hour", "competencies", "bias"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub learning_rate: f64,
    pub decay: f64,
    pub min_learning_rate: f64,
    pub window: usize,
    pub target_performance: f64,
    pub time_of_day_confidence: f64,
    pub progressive_confidence: f64,
    pub trend_confidence: f64,
    pub trend_threshold: f64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            decay: 0.99,
            min_learning_rate: 0.001,
            window: 5,
            target_performance: 0.7,
            time_of_day_confidence: 0.6,
            progressive_confidence: 0.7,
            trend_confidence: 0.65,
            trend_threshold: 0.01,
        }
    }
}

impl MetaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.learning_rate > 0.0) || !(self.min_learning_rate > 0.0) {
            return Err(ConfigError::invalid("meta.learning_rate", "must be > 0"));
        }
        if !(0.0 < self.decay && self.decay <= 1.0) {
            return Err(ConfigError::invalid("meta.decay", "must lie in (0, 1]"));
        }
        if self.window < 2 {
            return Err(ConfigError::invalid("meta.window", "must be >= 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaFeatures(pub [f64; FEATURE_COUNT]);

impl MetaFeatures {
    pub fn from_observation(observation: &AssessmentObservation) -> Self {
        let time = if observation.time_taken.is_finite() {
            (observation.time_taken / 1800.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self([
            observation.difficulty().index() as f64 / 4.0,
            time,
            observation.hour_of_day() as f64 / 24.0,
            (observation.competencies.len() as f64 / 5.0).min(1.0),
            1.0,
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=21 => Self::Evening,
            _ => Self::Night,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectedPattern {
    PreferredTimeOfDay { bucket: TimeOfDay, confidence: f64 },
    ProgressiveDifficulty { confidence: f64 },
    PerformanceTrend {
        direction: TrendDirection,
        slope: f64,
        confidence: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSample {
    pub features: MetaFeatures,
    pub performance: f64,
    pub hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaState {
    pub weights: [f64; FEATURE_COUNT],
    pub learning_rate: f64,
    pub updates: u32,
    #[serde(default)]
    pub recent: VecDeque<MetaSample>,
    #[serde(default)]
    pub patterns: Vec<DetectedPattern>,
}

impl MetaState {
    pub fn from_config(config: &MetaConfig) -> Self {
        Self {
            weights: [0.0; FEATURE_COUNT],
            learning_rate: config.learning_rate,
            updates: 0,
            recent: VecDeque::new(),
            patterns: Vec::new(),
        }
    }
}

impl Default for MetaState {
    fn default() -> Self {
        Self::from_config(&MetaConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaUpdate {
    pub error: f64,
    pub learning_rate: f64,
    pub prediction_before: f64,
    pub patterns: Vec<DetectedPattern>,
}

pub struct MetaLearner {
    config: MetaConfig,
}

impl Default for MetaLearner {
    fn default() -> Self {
        Self::new(MetaConfig::default())
    }
}

impl MetaLearner {
    pub fn new(config: MetaConfig) -> Self {
        Self { config }
    }

    pub fn initial_state(&self) -> MetaState {
        MetaState::from_config(&self.config)
    }

    pub fn predict(&self, state: &MetaState, features: &MetaFeatures) -> f64 {
        let dot: f64 = state
            .weights
            .iter()
            .zip(features.0.iter())
            .map(|(w, x)| w * x)
            .sum();
        (self.config.target_performance + dot).clamp(0.0, 1.0)
    }

    pub fn learn(&self, state: &mut MetaState, sample: MetaSample) -> MetaUpdate {
        let prediction_before = self.predict(state, &sample.features);
        let performance = if sample.performance.is_finite() {
            sample.performance.clamp(0.0, 1.0)
        } else {
            self.config.target_performance
        };
        let error = performance - self.config.target_performance;

        for (w, x) in state.weights.iter_mut().zip(sample.features.0.iter()) {
            *w += state.learning_rate * error * x;
        }
        state.learning_rate =
            (state.learning_rate * self.config.decay).max(self.config.min_learning_rate);
        state.updates = state.updates.saturating_add(1);

        state.recent.push_back(MetaSample {
            performance,
            ..sample
        });
        while state.recent.len() > self.config.window {
            state.recent.pop_front();
        }
        state.patterns = self.detect_patterns(&state.recent);

        MetaUpdate {
            error,
            learning_rate: state.learning_rate,
            prediction_before,
            patterns: state.patterns.clone(),
        }
    }

    pub fn detect_patterns(&self, recent: &VecDeque<MetaSample>) -> Vec<DetectedPattern> {
        let mut patterns = Vec::new();
        if recent.len() < self.config.window {
            return patterns;
        }

        if let Some(bucket) = self.preferred_time_of_day(recent) {
            patterns.push(DetectedPattern::PreferredTimeOfDay {
                bucket,
                confidence: self.config.time_of_day_confidence,
            });
        }

        let difficulties: Vec<f64> = recent.iter().map(|s| s.features.0[0]).collect();
        let non_decreasing = difficulties.windows(2).all(|w| w[1] >= w[0]);
        let rising = difficulties.last() > difficulties.first();
        if non_decreasing && rising {
            patterns.push(DetectedPattern::ProgressiveDifficulty {
                confidence: self.config.progressive_confidence,
            });
        }

        let performances: Vec<f64> = recent.iter().map(|s| s.performance).collect();
        let slope = least_squares_slope(&performances);
        if slope.abs() > self.config.trend_threshold {
            let direction = if slope > 0.0 {
                TrendDirection::Improving
            } else {
                TrendDirection::Declining
            };
            patterns.push(DetectedPattern::PerformanceTrend {
                direction,
                slope,
                confidence: self.config.trend_confidence,
            });
        }

        patterns
    }

    fn preferred_time_of_day(&self, recent: &VecDeque<MetaSample>) -> Option<TimeOfDay> {
        let buckets = [
            TimeOfDay::Morning,
            TimeOfDay::Afternoon,
            TimeOfDay::Evening,
            TimeOfDay::Night,
        ];
        let mut best: Option<(TimeOfDay, f64)> = None;
        for bucket in buckets {
            let scores: Vec<f64> = recent
                .iter()
                .filter(|s| TimeOfDay::from_hour(s.hour) == bucket)
                .map(|s| s.performance)
                .collect();
            if scores.len() < 2 {
                continue;
            }
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            if mean < self.config.target_performance {
                continue;
            }
            if best.map_or(true, |(_, m)| mean > m) {
                best = Some((bucket, mean));
            }
        }
        best.map(|(bucket, _)| bucket)
    }
}

fn least_squares_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();

    let denominator = n * sum_xx - sum_x.powi(2);
    if denominator.abs() < 1e-10 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(difficulty: f64, performance: f64, hour: u32) -> MetaSample {
        MetaSample {
            features: MetaFeatures([difficulty, 0.3, hour as f64 / 24.0, 0.2, 1.0]),
            performance,
            hour,
        }
    }

    #[test]
    fn test_untrained_prediction_is_target() {
        let learner = MetaLearner::default();
        let state = learner.initial_state();
        assert!((learner.predict(&state, &MetaFeatures([0.5; 5])) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_learning_rate_decays_to_floor() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        let mut previous = state.learning_rate;
        for _ in 0..1000 {
            let update = learner.learn(&mut state, sample(0.5, 0.9, 10));
            assert!(update.learning_rate <= previous);
            assert!(update.learning_rate >= 0.001);
            previous = update.learning_rate;
        }
        assert!((state.learning_rate - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_good_performance_raises_prediction() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        let features = sample(0.5, 0.95, 10).features;
        for _ in 0..10 {
            learner.learn(&mut state, sample(0.5, 0.95, 10));
        }
        assert!(learner.predict(&state, &features) > 0.7);
    }

    #[test]
    fn test_prediction_clamped() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        state.weights = [10.0; FEATURE_COUNT];
        assert_eq!(learner.predict(&state, &MetaFeatures([1.0; 5])), 1.0);
        state.weights = [-10.0; FEATURE_COUNT];
        assert_eq!(learner.predict(&state, &MetaFeatures([1.0; 5])), 0.0);
    }

    #[test]
    fn test_detects_progressive_difficulty_and_trend() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        for (i, perf) in [0.5, 0.6, 0.7, 0.8, 0.9].iter().enumerate() {
            learner.learn(&mut state, sample(i as f64 * 0.25, *perf, 3));
        }
        assert!(state
            .patterns
            .contains(&DetectedPattern::ProgressiveDifficulty { confidence: 0.7 }));
        assert!(state.patterns.iter().any(|p| matches!(
            p,
            DetectedPattern::PerformanceTrend {
                direction: TrendDirection::Improving,
                ..
            }
        )));
    }

    #[test]
    fn test_detects_preferred_time_of_day() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        for (hour, perf) in [(9, 0.9), (20, 0.4), (10, 0.85), (21, 0.5), (8, 0.88)] {
            learner.learn(&mut state, sample(0.5, perf, hour));
        }
        assert!(state.patterns.contains(&DetectedPattern::PreferredTimeOfDay {
            bucket: TimeOfDay::Morning,
            confidence: 0.6,
        }));
    }

    #[test]
    fn test_no_patterns_before_window_fills() {
        let learner = MetaLearner::default();
        let mut state = learner.initial_state();
        for i in 0..4 {
            learner.learn(&mut state, sample(i as f64 * 0.25, 0.5 + i as f64 * 0.1, 9));
        }
        assert!(state.patterns.is_empty());
    }

    #[test]
    fn test_slope_of_flat_series_is_zero() {
        assert_eq!(least_squares_slope(&[0.5, 0.5, 0.5]), 0.0);
        assert!((least_squares_slope(&[0.0, 1.0, 2.0]) - 1.0).abs() < 1e-12);
    }
}
