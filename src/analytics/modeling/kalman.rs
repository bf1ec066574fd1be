use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::analytics::error::ConfigError;

const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanConfig {
    pub initial_estimate: f64,
    pub initial_covariance: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    /// Trust factor base: applied deltas are scaled by `max(min_rate, decay^n)`.
    pub trust_decay: f64,
    pub min_rate: f64,
    pub max_adjustment: f64,
    pub min_uncertainty: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            initial_estimate: 50.0,
            initial_covariance: 100.0,
            process_noise: 1.0,
            measurement_noise: 10.0,
            trust_decay: 0.98,
            min_rate: 0.5,
            max_adjustment: 15.0,
            min_uncertainty: 0.5,
        }
    }
}

impl KalmanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.initial_covariance >= 0.0) {
            return Err(ConfigError::invalid("kalman.initial_covariance", "must be >= 0"));
        }
        if !(self.process_noise > 0.0) || !(self.measurement_noise > 0.0) {
            return Err(ConfigError::invalid(
                "kalman.noise",
                "process and measurement noise must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.trust_decay) || !(0.0..=1.0).contains(&self.min_rate) {
            return Err(ConfigError::invalid(
                "kalman.trust_decay",
                "trust decay and min rate must lie in [0, 1]",
            ));
        }
        if !(self.max_adjustment > 0.0) {
            return Err(ConfigError::invalid("kalman.max_adjustment", "must be > 0"));
        }
        if !(self.min_uncertainty >= 0.0) {
            return Err(ConfigError::invalid("kalman.min_uncertainty", "must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanPoint {
    pub measurement: f64,
    pub estimate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanState {
    pub estimate: f64,
    /// Posterior error covariance `P`.
    pub covariance: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub update_count: u32,
    #[serde(default)]
    pub history: VecDeque<KalmanPoint>,
}

impl KalmanState {
    pub fn from_config(config: &KalmanConfig) -> Self {
        Self {
            estimate: config.initial_estimate,
            covariance: config.initial_covariance,
            process_noise: config.process_noise,
            measurement_noise: config.measurement_noise,
            update_count: 0,
            history: VecDeque::new(),
        }
    }
}

impl Default for KalmanState {
    fn default() -> Self {
        Self::from_config(&KalmanConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanOutput {
    pub estimate: f64,
    pub uncertainty: f64,
    pub confidence: f64,
    pub gain: f64,
    pub applied_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanStatistics {
    pub estimate: f64,
    pub uncertainty: f64,
    pub confidence: f64,
    pub update_count: u32,
    pub last_measurement: Option<f64>,
}

pub struct KalmanSmoother {
    config: KalmanConfig,
}

impl Default for KalmanSmoother {
    fn default() -> Self {
        Self::new(KalmanConfig::default())
    }
}

impl KalmanSmoother {
    pub fn new(config: KalmanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KalmanConfig {
        &self.config
    }

    pub fn initial_state(&self) -> KalmanState {
        KalmanState::from_config(&self.config)
    }

    /// Prior covariance after the random-walk prediction step.
    pub fn predict(&self, state: &KalmanState) -> f64 {
        state.covariance.max(0.0) + state.process_noise
    }

    pub fn update(&self, state: &mut KalmanState, measurement: f64) -> KalmanOutput {
        if !measurement.is_finite() {
            tracing::debug!(measurement, "ignoring non-finite kalman measurement");
            return self.output(state, 0.0, 0.0);
        }

        let prior = self.predict(state);
        let denom = prior + state.measurement_noise;
        let gain = if denom > 0.0 { prior / denom } else { 0.0 };

        let innovation = measurement - state.estimate;
        let trust = self
            .config
            .trust_decay
            .powi(state.update_count as i32)
            .max(self.config.min_rate);
        let delta = (gain * innovation * trust)
            .clamp(-self.config.max_adjustment, self.config.max_adjustment);

        state.estimate += delta;
        state.covariance = ((1.0 - gain) * prior).max(0.0);
        state.update_count = state.update_count.saturating_add(1);

        state.history.push_back(KalmanPoint {
            measurement,
            estimate: state.estimate,
        });
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }

        self.output(state, gain, delta)
    }

    pub fn reset(&self, state: &mut KalmanState) {
        *state = self.initial_state();
    }

    pub fn uncertainty(&self, state: &KalmanState) -> f64 {
        state.covariance.max(0.0).sqrt().max(self.config.min_uncertainty)
    }

    pub fn confidence(&self, state: &KalmanState) -> f64 {
        (1.0 - state.covariance / 100.0).clamp(0.0, 1.0)
    }

    /// Fixed point of the posterior covariance: positive root of `P² + QP − QR = 0`.
    pub fn steady_state_covariance(&self) -> f64 {
        let q = self.config.process_noise;
        let r = self.config.measurement_noise;
        (-q + (q * q + 4.0 * q * r).sqrt()) / 2.0
    }

    pub fn steady_state_uncertainty(&self) -> f64 {
        self.steady_state_covariance()
            .sqrt()
            .max(self.config.min_uncertainty)
    }

    pub fn statistics(&self, state: &KalmanState) -> KalmanStatistics {
        KalmanStatistics {
            estimate: state.estimate,
            uncertainty: self.uncertainty(state),
            confidence: self.confidence(state),
            update_count: state.update_count,
            last_measurement: state.history.back().map(|p| p.measurement),
        }
    }

    fn output(&self, state: &KalmanState, gain: f64, applied_delta: f64) -> KalmanOutput {
        KalmanOutput {
            estimate: state.estimate,
            uncertainty: self.uncertainty(state),
            confidence: self.confidence(state),
            gain,
            applied_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_measurement_converges() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        for _ in 0..25 {
            kalman.update(&mut state, 80.0);
        }
        assert!((state.estimate - 80.0).abs() < 1.0, "estimate={}", state.estimate);
    }

    #[test]
    fn test_uncertainty_decreases_to_fixed_point() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        let mut previous = kalman.uncertainty(&state);
        for _ in 0..30 {
            let out = kalman.update(&mut state, 60.0);
            assert!(out.uncertainty <= previous + 1e-12);
            assert!(out.uncertainty >= 0.0);
            previous = out.uncertainty;
        }
        let floor = kalman.steady_state_uncertainty();
        assert!((previous - floor).abs() / floor < 0.1);
    }

    #[test]
    fn test_adjustment_clamped() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        let out = kalman.update(&mut state, 100.0);
        assert!(out.applied_delta <= kalman.config().max_adjustment + 1e-12);
        assert!((state.estimate - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_measurement_ignored() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        kalman.update(&mut state, f64::NAN);
        assert_eq!(state.update_count, 0);
        assert!(state.estimate.is_finite());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        for score in [30.0, 90.0, 45.0] {
            kalman.update(&mut state, score);
        }
        kalman.reset(&mut state);
        let fresh = kalman.initial_state();
        assert_eq!(state.estimate, fresh.estimate);
        assert_eq!(state.covariance, fresh.covariance);
        assert_eq!(state.update_count, 0);
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_history_bounded() {
        let kalman = KalmanSmoother::default();
        let mut state = kalman.initial_state();
        for i in 0..(MAX_HISTORY + 10) {
            kalman.update(&mut state, i as f64);
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }
}
