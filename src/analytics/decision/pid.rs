use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::analytics::error::{AnalyticsError, ConfigError};
use crate::analytics::types::DifficultyLevel;

const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Target miss rate, percent.
    pub setpoint: f64,
    pub dt: f64,
    pub dead_zone: f64,
    pub integral_min: f64,
    pub integral_max: f64,
    pub derivative_filter: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub relay_amplitude: f64,
    pub min_autotune_samples: usize,
    pub metrics_window: usize,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.8,
            ki: 0.05,
            kd: 0.2,
            setpoint: 30.0,
            dt: 1.0,
            dead_zone: 2.0,
            integral_min: -200.0,
            integral_max: 200.0,
            derivative_filter: 0.3,
            output_min: 0.5,
            output_max: 1.5,
            relay_amplitude: 10.0,
            min_autotune_samples: 10,
            metrics_window: 5,
        }
    }
}

impl PidConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt > 0.0) {
            return Err(ConfigError::invalid("pid.dt", "must be > 0"));
        }
        if !(self.integral_min < self.integral_max) {
            return Err(ConfigError::invalid(
                "pid.integral",
                "integral_min must be below integral_max",
            ));
        }
        if !(self.output_min < self.output_max) {
            return Err(ConfigError::invalid(
                "pid.output",
                "output_min must be below output_max",
            ));
        }
        if !(0.0..=1.0).contains(&self.derivative_filter) {
            return Err(ConfigError::invalid("pid.derivative_filter", "must lie in [0, 1]"));
        }
        if self.dead_zone < 0.0 {
            return Err(ConfigError::invalid("pid.dead_zone", "must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidSample {
    pub measurement: f64,
    pub error: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub integral: f64,
    pub previous_error: f64,
    pub previous_measurement: Option<f64>,
    pub filtered_derivative: f64,
    pub output: f64,
    pub update_count: u32,
    #[serde(default)]
    pub history: VecDeque<PidSample>,
}

impl PidState {
    pub fn from_config(config: &PidConfig) -> Self {
        Self {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            setpoint: config.setpoint,
            integral: 0.0,
            previous_error: 0.0,
            previous_measurement: None,
            filtered_derivative: 0.0,
            output: 1.0,
            update_count: 0,
            history: VecDeque::new(),
        }
    }
}

impl Default for PidState {
    fn default() -> Self {
        Self::from_config(&PidConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidOutput {
    pub error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub multiplier: f64,
    pub level: DifficultyLevel,
    /// True when the error fell inside the dead zone.
    pub held: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotuneReport {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub ultimate_gain: f64,
    pub ultimate_period: f64,
    pub amplitude: f64,
    pub extrema: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidStatistics {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub integral: f64,
    pub output: f64,
    pub recommended: DifficultyLevel,
    pub stability: f64,
    pub convergence: f64,
    pub update_count: u32,
}

pub struct PidDifficultyController {
    config: PidConfig,
}

impl Default for PidDifficultyController {
    fn default() -> Self {
        Self::new(PidConfig::default())
    }
}

impl PidDifficultyController {
    pub fn new(config: PidConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PidConfig {
        &self.config
    }

    pub fn initial_state(&self) -> PidState {
        PidState::from_config(&self.config)
    }

    /// Miss rate for a 0..100 score.
    pub fn measurement_for_score(score: f64) -> f64 {
        100.0 - score.clamp(0.0, 100.0)
    }

    pub fn update(&self, state: &mut PidState, score: f64) -> PidOutput {
        let measurement = Self::measurement_for_score(score);
        let error = state.setpoint - measurement;

        if error.abs() < self.config.dead_zone {
            self.record(state, measurement, error);
            return PidOutput {
                error,
                proportional: 0.0,
                integral: 0.0,
                derivative: 0.0,
                multiplier: state.output,
                level: self.nearest_level(state.output),
                held: true,
            };
        }

        let dt = self.config.dt;
        let proportional = state.kp * error;

        state.integral = (state.integral + error * dt)
            .clamp(self.config.integral_min, self.config.integral_max);
        let integral = state.ki * state.integral;

        // Derivative on measurement avoids a kick when the setpoint changes.
        let raw = state
            .previous_measurement
            .map_or(0.0, |prev| (measurement - prev) / dt);
        let alpha = self.config.derivative_filter;
        state.filtered_derivative = alpha * raw + (1.0 - alpha) * state.filtered_derivative;
        let derivative = -state.kd * state.filtered_derivative;

        let multiplier = (1.0 + (proportional + integral + derivative) / 100.0)
            .clamp(self.config.output_min, self.config.output_max);

        state.previous_error = error;
        state.previous_measurement = Some(measurement);
        state.output = multiplier;
        self.record(state, measurement, error);

        tracing::debug!(error, multiplier, "pid update");

        PidOutput {
            error,
            proportional,
            integral,
            derivative,
            multiplier,
            level: self.nearest_level(multiplier),
            held: false,
        }
    }

    /// Nearest nominal difficulty; ties go to the easier level.
    pub fn nearest_level(&self, multiplier: f64) -> DifficultyLevel {
        let mut best = DifficultyLevel::ALL[0];
        let mut best_distance = f64::INFINITY;
        for level in DifficultyLevel::ALL {
            let distance = (level.nominal_multiplier() - multiplier).abs();
            if distance < best_distance - 1e-9 {
                best = level;
                best_distance = distance;
            }
        }
        best
    }

    pub fn reset(&self, state: &mut PidState) {
        *state = self.initial_state();
    }

    /// Relay-style Ziegler–Nichols tuning from the recorded measurement oscillation.
    pub fn autotune(&self, state: &mut PidState) -> Result<AutotuneReport, AnalyticsError> {
        let required = self.config.min_autotune_samples;
        let series: Vec<f64> = state.history.iter().map(|s| s.measurement).collect();
        if series.len() < required {
            return Err(AnalyticsError::insufficient("pid_autotune", required, series.len()));
        }

        let extrema = find_extrema(&series);
        if extrema.len() < 2 {
            return Err(AnalyticsError::insufficient("pid_autotune_extrema", 2, extrema.len()));
        }

        let peaks: Vec<f64> = extrema.iter().filter(|e| e.peak).map(|e| e.value).collect();
        let troughs: Vec<f64> = extrema.iter().filter(|e| !e.peak).map(|e| e.value).collect();
        let amplitude = if !peaks.is_empty() && !troughs.is_empty() {
            (mean(&peaks) - mean(&troughs)) / 2.0
        } else {
            let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = series.iter().copied().fold(f64::INFINITY, f64::min);
            (max - min) / 2.0
        };
        if !(amplitude > 0.0) {
            return Err(AnalyticsError::NumericDegeneracy(
                "oscillation amplitude is zero".into(),
            ));
        }

        // Consecutive extrema are half a period apart.
        let gaps: Vec<f64> = extrema
            .windows(2)
            .map(|w| (w[1].index - w[0].index) as f64 * self.config.dt)
            .collect();
        let period = 2.0 * mean(&gaps);
        if !(period > 0.0) {
            return Err(AnalyticsError::NumericDegeneracy(
                "oscillation period is zero".into(),
            ));
        }

        let ku = 4.0 * self.config.relay_amplitude / (std::f64::consts::PI * amplitude);
        state.kp = 0.6 * ku;
        state.ki = 1.2 * ku / period;
        state.kd = 0.075 * ku * period;

        tracing::info!(kp = state.kp, ki = state.ki, kd = state.kd, "pid autotuned");

        Ok(AutotuneReport {
            kp: state.kp,
            ki: state.ki,
            kd: state.kd,
            ultimate_gain: ku,
            ultimate_period: period,
            amplitude,
            extrema: extrema.len(),
        })
    }

    /// `1 / (1 + var/100)` over the recent errors; 1.0 with fewer than two samples.
    pub fn stability(&self, state: &PidState) -> f64 {
        let errors = self.recent_errors(state);
        if errors.len() < 2 {
            return 1.0;
        }
        let m = mean(&errors);
        let variance = errors.iter().map(|e| (e - m).powi(2)).sum::<f64>() / errors.len() as f64;
        1.0 / (1.0 + variance / 100.0)
    }

    pub fn convergence(&self, state: &PidState) -> f64 {
        let errors = self.recent_errors(state);
        if errors.is_empty() {
            return 0.0;
        }
        let mean_abs = errors.iter().map(|e| e.abs()).sum::<f64>() / errors.len() as f64;
        (1.0 - mean_abs / 100.0).clamp(0.0, 1.0)
    }

    pub fn statistics(&self, state: &PidState) -> PidStatistics {
        PidStatistics {
            kp: state.kp,
            ki: state.ki,
            kd: state.kd,
            setpoint: state.setpoint,
            integral: state.integral,
            output: state.output,
            recommended: self.nearest_level(state.output),
            stability: self.stability(state),
            convergence: self.convergence(state),
            update_count: state.update_count,
        }
    }

    fn record(&self, state: &mut PidState, measurement: f64, error: f64) {
        state.update_count = state.update_count.saturating_add(1);
        state.history.push_back(PidSample {
            measurement,
            error,
            output: state.output,
        });
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    fn recent_errors(&self, state: &PidState) -> Vec<f64> {
        let skip = state.history.len().saturating_sub(self.config.metrics_window);
        state.history.iter().skip(skip).map(|s| s.error).collect()
    }
}

struct Extremum {
    index: usize,
    value: f64,
    peak: bool,
}

fn find_extrema(series: &[f64]) -> Vec<Extremum> {
    let mut extrema = Vec::new();
    for i in 1..series.len().saturating_sub(1) {
        let (prev, cur, next) = (series[i - 1], series[i], series[i + 1]);
        if cur > prev && cur > next {
            extrema.push(Extremum {
                index: i,
                value: cur,
                peak: true,
            });
        } else if cur < prev && cur < next {
            extrema.push(Extremum {
                index: i,
                value: cur,
                peak: false,
            });
        }
    }
    extrema
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_setpoint_output_is_unity() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        let out = pid.update(&mut state, 70.0);
        assert!(out.held);
        assert_eq!(out.multiplier, 1.0);
        assert_eq!(out.level, DifficultyLevel::Medium);
    }

    #[test]
    fn test_dead_zone_holds_previous_output() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        pid.update(&mut state, 95.0);
        let before = state.clone();
        let out = pid.update(&mut state, 71.0);
        assert!(out.held);
        assert_eq!(out.multiplier, before.output);
        assert_eq!(state.integral, before.integral);
        assert_eq!(state.filtered_derivative, before.filtered_derivative);
    }

    #[test]
    fn test_strong_student_gets_harder_work() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        let out = pid.update(&mut state, 95.0);
        assert!(out.multiplier > 1.0);
        let mut weak = pid.initial_state();
        let out = pid.update(&mut weak, 20.0);
        assert!(out.multiplier < 1.0);
    }

    #[test]
    fn test_integral_stays_clamped() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for _ in 0..100 {
            pid.update(&mut state, 0.0);
            assert!(state.integral >= -200.0 && state.integral <= 200.0);
        }
        assert_eq!(state.integral, -200.0);
        assert_eq!(state.output, 0.5);
    }

    #[test]
    fn test_nearest_level_ties_go_lower() {
        let pid = PidDifficultyController::default();
        assert_eq!(pid.nearest_level(0.9), DifficultyLevel::Easy);
        assert_eq!(pid.nearest_level(1.1), DifficultyLevel::Medium);
        assert_eq!(pid.nearest_level(1.5), DifficultyLevel::VeryHard);
        assert_eq!(pid.nearest_level(0.5), DifficultyLevel::VeryEasy);
    }

    #[test]
    fn test_autotune_needs_samples() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for _ in 0..5 {
            pid.update(&mut state, 60.0);
        }
        assert!(matches!(
            pid.autotune(&mut state),
            Err(AnalyticsError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_autotune_needs_oscillation() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for i in 0..12 {
            pid.update(&mut state, 40.0 + i as f64 * 4.0);
        }
        assert!(matches!(
            pid.autotune(&mut state),
            Err(AnalyticsError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_autotune_from_oscillation() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for i in 0..12 {
            let score = if i % 2 == 0 { 90.0 } else { 50.0 };
            pid.update(&mut state, score);
        }
        let report = pid.autotune(&mut state).unwrap();
        // Miss rate swings 10 <-> 50: amplitude 20, period 2.
        assert!((report.amplitude - 20.0).abs() < 1e-9);
        assert!((report.ultimate_period - 2.0).abs() < 1e-9);
        let ku = 40.0 / (std::f64::consts::PI * 20.0);
        assert!((state.kp - 0.6 * ku).abs() < 1e-9);
        assert!((state.ki - 1.2 * ku / 2.0).abs() < 1e-9);
        assert!((state.kd - 0.075 * ku * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for score in [10.0, 95.0, 40.0] {
            pid.update(&mut state, score);
        }
        pid.reset(&mut state);
        assert_eq!(state.integral, 0.0);
        assert_eq!(state.output, 1.0);
        assert_eq!(state.update_count, 0);
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_steady_errors_are_stable() {
        let pid = PidDifficultyController::default();
        let mut state = pid.initial_state();
        for _ in 0..5 {
            pid.update(&mut state, 70.0);
        }
        assert_eq!(pid.stability(&state), 1.0);
        assert_eq!(pid.convergence(&state), 1.0);
    }
}
