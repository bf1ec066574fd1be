//! Discrete hidden Markov model over learning states.
//!
//! Hidden states follow [`LearningState`] order; observations are scores
//! bucketed into low / medium / high. Forward and backward passes are scaled
//! per time step so long histories stay representable, and Viterbi runs in
//! log space. Baum-Welch retraining is periodic and capped in iterations.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::analytics::error::{AnalyticsError, ConfigError};
use crate::analytics::types::LearningState;

const ROW_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSymbol {
    Low,
    Medium,
    High,
}

impl ObservationSymbol {
    pub const COUNT: usize = 3;

    pub fn index(&self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmParameters {
    pub initial: Vec<f64>,
    pub transition: Vec<Vec<f64>>,
    pub emission: Vec<Vec<f64>>,
}

impl Default for HmmParameters {
    fn default() -> Self {
        Self {
            initial: vec![0.4, 0.3, 0.2, 0.1],
            transition: vec![
                vec![0.60, 0.30, 0.08, 0.02],
                vec![0.10, 0.60, 0.25, 0.05],
                vec![0.03, 0.12, 0.60, 0.25],
                vec![0.02, 0.05, 0.18, 0.75],
            ],
            emission: vec![
                vec![0.70, 0.25, 0.05],
                vec![0.30, 0.55, 0.15],
                vec![0.10, 0.45, 0.45],
                vec![0.05, 0.25, 0.70],
            ],
        }
    }
}

impl HmmParameters {
    pub fn state_count(&self) -> usize {
        self.initial.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = LearningState::ALL.len();
        if self.initial.len() != n || self.transition.len() != n || self.emission.len() != n {
            return Err(ConfigError::invalid(
                "hmm.parameters",
                format!("expected {n} hidden states"),
            ));
        }
        if !row_is_stochastic(&self.initial) {
            return Err(ConfigError::invalid("hmm.parameters.initial", "must sum to 1"));
        }
        for row in &self.transition {
            if row.len() != n || !row_is_stochastic(row) {
                return Err(ConfigError::invalid(
                    "hmm.parameters.transition",
                    "rows must be stochastic and square",
                ));
            }
        }
        for row in &self.emission {
            if row.len() != ObservationSymbol::COUNT || !row_is_stochastic(row) {
                return Err(ConfigError::invalid(
                    "hmm.parameters.emission",
                    "rows must be stochastic over 3 symbols",
                ));
            }
        }
        Ok(())
    }
}

fn row_is_stochastic(row: &[f64]) -> bool {
    row.iter().all(|p| p.is_finite() && *p >= 0.0)
        && (row.iter().sum::<f64>() - 1.0).abs() < ROW_TOLERANCE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmConfig {
    /// Values below this are `low`.
    pub low_threshold: f64,
    /// Values at or above this are `high`.
    pub high_threshold: f64,
    pub max_history: usize,
    pub retrain_interval: u32,
    pub min_training_length: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub probability_floor: f64,
    pub parameters: HmmParameters,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            low_threshold: 45.0,
            high_threshold: 55.0,
            max_history: 100,
            retrain_interval: 20,
            min_training_length: 20,
            max_iterations: 50,
            tolerance: 1e-6,
            probability_floor: 1e-6,
            parameters: HmmParameters::default(),
        }
    }
}

impl HmmConfig {
    /// Per-competency variant fed raw 0-100 scores instead of the SPI raw index.
    pub fn competency_default() -> Self {
        Self {
            low_threshold: 60.0,
            high_threshold: 80.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.low_threshold < self.high_threshold) {
            return Err(ConfigError::invalid(
                "hmm.thresholds",
                "low threshold must be below high threshold",
            ));
        }
        if self.max_history < 2 || self.min_training_length < 2 {
            return Err(ConfigError::invalid(
                "hmm.history",
                "history and training length must be at least 2",
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("hmm.max_iterations", "must be > 0"));
        }
        if !(self.probability_floor >= 0.0 && self.probability_floor < 0.1) {
            return Err(ConfigError::invalid("hmm.probability_floor", "must be in [0, 0.1)"));
        }
        self.parameters.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmState {
    pub parameters: HmmParameters,
    pub current_state: Option<LearningState>,
    #[serde(default)]
    pub observation_history: VecDeque<ObservationSymbol>,
    #[serde(default)]
    pub observations_since_training: u32,
    #[serde(default)]
    pub training_count: u32,
    #[serde(default)]
    pub last_log_likelihood: Option<f64>,
}

impl HmmState {
    pub fn from_config(config: &HmmConfig) -> Self {
        Self {
            parameters: config.parameters.clone(),
            current_state: None,
            observation_history: VecDeque::new(),
            observations_since_training: 0,
            training_count: 0,
            last_log_likelihood: None,
        }
    }

    pub fn symbol_indices(&self) -> Vec<usize> {
        self.observation_history.iter().map(|s| s.index()).collect()
    }
}

impl Default for HmmState {
    fn default() -> Self {
        Self::from_config(&HmmConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Per-step normalized forward variables.
    pub alpha: Vec<Vec<f64>>,
    pub scales: Vec<f64>,
}

impl ForwardPass {
    pub fn log_likelihood(&self) -> f64 {
        self.scales.iter().map(|c| c.ln()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaumWelchReport {
    pub parameters: HmmParameters,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmOutput {
    pub symbol: ObservationSymbol,
    pub state: LearningState,
    pub next_state: LearningState,
    pub path_length: usize,
    pub retrained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmStatistics {
    pub current_state: Option<LearningState>,
    pub next_state: Option<LearningState>,
    pub history_length: usize,
    pub training_count: u32,
    pub last_log_likelihood: Option<f64>,
}

pub struct HiddenMarkovModel {
    config: HmmConfig,
}

impl Default for HiddenMarkovModel {
    fn default() -> Self {
        Self::new(HmmConfig::default())
    }
}

impl HiddenMarkovModel {
    pub fn new(config: HmmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HmmConfig {
        &self.config
    }

    pub fn initial_state(&self) -> HmmState {
        HmmState::from_config(&self.config)
    }

    pub fn classify(&self, value: f64) -> ObservationSymbol {
        if value < self.config.low_threshold {
            ObservationSymbol::Low
        } else if value >= self.config.high_threshold {
            ObservationSymbol::High
        } else {
            ObservationSymbol::Medium
        }
    }

    pub fn viterbi(params: &HmmParameters, observations: &[usize]) -> Vec<usize> {
        let Some((&first, rest)) = observations.split_first() else {
            return Vec::new();
        };
        let n = params.state_count();

        let mut delta: Vec<f64> = (0..n)
            .map(|s| ln(params.initial[s]) + ln(emission(params, s, first)))
            .collect();
        let mut backpointers: Vec<Vec<usize>> = Vec::with_capacity(observations.len());
        backpointers.push(vec![0; n]);

        for &obs in rest {
            let mut next = vec![f64::NEG_INFINITY; n];
            let mut back = vec![0usize; n];
            for (j, (next_j, back_j)) in next.iter_mut().zip(back.iter_mut()).enumerate() {
                let mut best = f64::NEG_INFINITY;
                let mut best_idx = 0;
                for (i, d) in delta.iter().enumerate() {
                    let candidate = d + ln(params.transition[i][j]);
                    if candidate > best {
                        best = candidate;
                        best_idx = i;
                    }
                }
                *next_j = best + ln(emission(params, j, obs));
                *back_j = best_idx;
            }
            delta = next;
            backpointers.push(back);
        }

        let mut path = vec![0usize; observations.len()];
        let mut current = argmax(&delta);
        for t in (0..observations.len()).rev() {
            path[t] = current;
            current = backpointers[t][current];
        }
        path
    }

    pub fn forward(
        params: &HmmParameters,
        observations: &[usize],
    ) -> Result<ForwardPass, AnalyticsError> {
        let n = params.state_count();
        let mut alpha: Vec<Vec<f64>> = Vec::with_capacity(observations.len());
        let mut scales = Vec::with_capacity(observations.len());

        for (t, &obs) in observations.iter().enumerate() {
            let mut row: Vec<f64> = if t == 0 {
                (0..n)
                    .map(|s| params.initial[s] * emission(params, s, obs))
                    .collect()
            } else {
                let prev = &alpha[t - 1];
                (0..n)
                    .map(|j| {
                        let incoming: f64 =
                            (0..n).map(|i| prev[i] * params.transition[i][j]).sum();
                        incoming * emission(params, j, obs)
                    })
                    .collect()
            };

            let scale: f64 = row.iter().sum();
            if !(scale > 0.0) || !scale.is_finite() {
                return Err(AnalyticsError::NumericDegeneracy(format!(
                    "forward pass collapsed at step {t}"
                )));
            }
            for value in row.iter_mut() {
                *value /= scale;
            }
            alpha.push(row);
            scales.push(scale);
        }

        Ok(ForwardPass { alpha, scales })
    }

    /// Scaled backward pass; a single observation yields all ones.
    pub fn backward(params: &HmmParameters, observations: &[usize], scales: &[f64]) -> Vec<Vec<f64>> {
        let n = params.state_count();
        let len = observations.len();
        let mut beta = vec![vec![1.0; n]; len];
        if len < 2 {
            return beta;
        }

        for t in (0..len - 1).rev() {
            let obs = observations[t + 1];
            let scale = scales[t + 1];
            for i in 0..n {
                let sum: f64 = (0..n)
                    .map(|j| params.transition[i][j] * emission(params, j, obs) * beta[t + 1][j])
                    .sum();
                beta[t][i] = sum / scale;
            }
        }
        beta
    }

    pub fn log_likelihood(
        params: &HmmParameters,
        observations: &[usize],
    ) -> Result<f64, AnalyticsError> {
        Ok(Self::forward(params, observations)?.log_likelihood())
    }

    pub fn baum_welch(
        &self,
        initial: &HmmParameters,
        observations: &[usize],
    ) -> Result<BaumWelchReport, AnalyticsError> {
        if observations.len() < 2 {
            return Err(AnalyticsError::insufficient("hmm", 2, observations.len()));
        }

        let n = initial.state_count();
        let len = observations.len();
        let mut params = initial.clone();
        let mut previous_ll: Option<f64> = None;
        let mut iterations = 0;
        let mut converged = false;
        let mut log_likelihood = f64::NEG_INFINITY;

        for _ in 0..self.config.max_iterations {
            let fwd = Self::forward(&params, observations)?;
            log_likelihood = fwd.log_likelihood();
            if let Some(prev) = previous_ll {
                if (log_likelihood - prev).abs() < self.config.tolerance {
                    converged = true;
                    break;
                }
            }
            previous_ll = Some(log_likelihood);

            let beta = Self::backward(&params, observations, &fwd.scales);

            let gamma: Vec<Vec<f64>> = (0..len)
                .map(|t| {
                    let mut row: Vec<f64> = (0..n).map(|i| fwd.alpha[t][i] * beta[t][i]).collect();
                    let total: f64 = row.iter().sum();
                    if total > 0.0 {
                        for value in row.iter_mut() {
                            *value /= total;
                        }
                    }
                    row
                })
                .collect();

            let mut xi_sum = vec![vec![0.0; n]; n];
            for t in 0..len - 1 {
                let obs = observations[t + 1];
                let mut xi = vec![vec![0.0; n]; n];
                let mut total = 0.0;
                for (i, xi_row) in xi.iter_mut().enumerate() {
                    for (j, cell) in xi_row.iter_mut().enumerate() {
                        *cell = fwd.alpha[t][i]
                            * params.transition[i][j]
                            * emission(&params, j, obs)
                            * beta[t + 1][j];
                        total += *cell;
                    }
                }
                if total > 0.0 {
                    for (i, xi_row) in xi.iter().enumerate() {
                        for (j, cell) in xi_row.iter().enumerate() {
                            xi_sum[i][j] += cell / total;
                        }
                    }
                }
            }

            params.initial = gamma[0].clone();

            for i in 0..n {
                let denom: f64 = gamma[..len - 1].iter().map(|g| g[i]).sum();
                if denom > 0.0 {
                    for j in 0..n {
                        params.transition[i][j] = xi_sum[i][j] / denom;
                    }
                }

                let denom_b: f64 = gamma.iter().map(|g| g[i]).sum();
                if denom_b > 0.0 {
                    for k in 0..ObservationSymbol::COUNT {
                        let numer: f64 = gamma
                            .iter()
                            .zip(observations.iter())
                            .filter(|(_, obs)| **obs == k)
                            .map(|(g, _)| g[i])
                            .sum();
                        params.emission[i][k] = numer / denom_b;
                    }
                }
            }

            let floor = self.config.probability_floor;
            normalize_row(&mut params.initial, floor);
            for row in params.transition.iter_mut() {
                normalize_row(row, floor);
            }
            for row in params.emission.iter_mut() {
                normalize_row(row, floor);
            }
            iterations += 1;
        }

        if !converged {
            log_likelihood = Self::log_likelihood(&params, observations)?;
        }

        Ok(BaumWelchReport {
            parameters: params,
            iterations,
            log_likelihood,
            converged,
        })
    }

    pub fn predict_next(params: &HmmParameters, current: usize) -> usize {
        params
            .transition
            .get(current)
            .map(|row| argmax(row))
            .unwrap_or(current)
    }

    pub fn observe(&self, state: &mut HmmState, value: f64) -> HmmOutput {
        let symbol = self.classify(value);
        state.observation_history.push_back(symbol);
        while state.observation_history.len() > self.config.max_history {
            state.observation_history.pop_front();
        }
        state.observations_since_training = state.observations_since_training.saturating_add(1);

        let sequence = state.symbol_indices();
        let mut retrained = false;
        if state.observations_since_training >= self.config.retrain_interval
            && sequence.len() >= self.config.min_training_length
        {
            match self.baum_welch(&state.parameters, &sequence) {
                Ok(report) => {
                    tracing::debug!(
                        iterations = report.iterations,
                        log_likelihood = report.log_likelihood,
                        converged = report.converged,
                        "hmm retrained"
                    );
                    state.parameters = report.parameters;
                    state.last_log_likelihood = Some(report.log_likelihood);
                    state.training_count = state.training_count.saturating_add(1);
                    retrained = true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "hmm retraining skipped");
                }
            }
            state.observations_since_training = 0;
        }

        let path = Self::viterbi(&state.parameters, &sequence);
        let current = path.last().copied().unwrap_or(0);
        let next = Self::predict_next(&state.parameters, current);
        let current_state = LearningState::from_index(current).unwrap_or(LearningState::Learning);
        state.current_state = Some(current_state);

        HmmOutput {
            symbol,
            state: current_state,
            next_state: LearningState::from_index(next).unwrap_or(current_state),
            path_length: path.len(),
            retrained,
        }
    }

    pub fn statistics(&self, state: &HmmState) -> HmmStatistics {
        let next_state = state.current_state.and_then(|current| {
            LearningState::from_index(Self::predict_next(&state.parameters, current.index()))
        });
        HmmStatistics {
            current_state: state.current_state,
            next_state,
            history_length: state.observation_history.len(),
            training_count: state.training_count,
            last_log_likelihood: state.last_log_likelihood,
        }
    }
}

fn emission(params: &HmmParameters, state: usize, obs: usize) -> f64 {
    params.emission[state].get(obs).copied().unwrap_or(0.0)
}

fn ln(p: f64) -> f64 {
    if p > 0.0 {
        p.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Index of the first maximum; NaN entries never win.
fn argmax(values: &[f64]) -> usize {
    let mut best_idx = 0;
    let mut best = f64::NEG_INFINITY;
    for (idx, &value) in values.iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    best_idx
}

fn normalize_row(row: &mut [f64], floor: f64) {
    for value in row.iter_mut() {
        if !value.is_finite() || *value < floor {
            *value = floor;
        }
    }
    let total: f64 = row.iter().sum();
    if total > 0.0 {
        for value in row.iter_mut() {
            *value /= total;
        }
    } else if !row.is_empty() {
        let uniform = 1.0 / row.len() as f64;
        row.iter_mut().for_each(|v| *v = uniform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sequence() -> Vec<usize> {
        vec![0, 0, 1, 1, 1, 2, 1, 2, 2, 2, 2, 1, 2, 2, 0, 1, 2, 2, 2, 2]
    }

    fn assert_stochastic(params: &HmmParameters) {
        assert!((params.initial.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for row in params.transition.iter().chain(params.emission.iter()) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|p| p.is_finite() && *p >= 0.0));
        }
    }

    #[test]
    fn test_default_parameters_valid() {
        assert!(HmmParameters::default().validate().is_ok());
        assert!(HmmConfig::default().validate().is_ok());
        assert!(HmmConfig::competency_default().validate().is_ok());
    }

    #[test]
    fn test_viterbi_path_length_matches_observations() {
        let params = HmmParameters::default();
        let obs = sample_sequence();
        assert_eq!(HiddenMarkovModel::viterbi(&params, &obs).len(), obs.len());
        assert!(HiddenMarkovModel::viterbi(&params, &[]).is_empty());
    }

    #[test]
    fn test_viterbi_single_observation_is_prior_times_emission_argmax() {
        let params = HmmParameters::default();
        for obs in 0..ObservationSymbol::COUNT {
            let scores: Vec<f64> = (0..params.state_count())
                .map(|s| params.initial[s] * params.emission[s][obs])
                .collect();
            let path = HiddenMarkovModel::viterbi(&params, &[obs]);
            assert_eq!(path, vec![argmax(&scores)]);
        }
    }

    #[test]
    fn test_viterbi_ties_pick_first_state() {
        let params = HmmParameters {
            initial: vec![0.25; 4],
            transition: vec![vec![0.25; 4]; 4],
            emission: vec![vec![1.0 / 3.0; 3]; 4],
        };
        assert_eq!(HiddenMarkovModel::viterbi(&params, &[0, 1, 2]), vec![0, 0, 0]);
    }

    #[test]
    fn test_backward_single_observation_is_ones() {
        let params = HmmParameters::default();
        let fwd = HiddenMarkovModel::forward(&params, &[2]).unwrap();
        let beta = HiddenMarkovModel::backward(&params, &[2], &fwd.scales);
        assert_eq!(beta, vec![vec![1.0; 4]]);
    }

    #[test]
    fn test_forward_matches_brute_force_two_steps() {
        let params = HmmParameters::default();
        let obs = [0usize, 2];
        let mut brute = 0.0;
        for s0 in 0..4 {
            for s1 in 0..4 {
                brute += params.initial[s0]
                    * params.emission[s0][obs[0]]
                    * params.transition[s0][s1]
                    * params.emission[s1][obs[1]];
            }
        }
        let ll = HiddenMarkovModel::log_likelihood(&params, &obs).unwrap();
        assert!((ll - brute.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_baum_welch_keeps_rows_stochastic() {
        let hmm = HiddenMarkovModel::default();
        let report = hmm
            .baum_welch(&HmmParameters::default(), &sample_sequence())
            .unwrap();
        assert!(report.iterations >= 1);
        assert_stochastic(&report.parameters);
    }

    #[test]
    fn test_baum_welch_does_not_decrease_likelihood() {
        let hmm = HiddenMarkovModel::default();
        let obs = sample_sequence();
        let before = HiddenMarkovModel::log_likelihood(&HmmParameters::default(), &obs).unwrap();
        let report = hmm.baum_welch(&HmmParameters::default(), &obs).unwrap();
        assert!(report.log_likelihood >= before - 1e-4);
    }

    #[test]
    fn test_baum_welch_requires_two_observations() {
        let hmm = HiddenMarkovModel::default();
        let err = hmm.baum_welch(&HmmParameters::default(), &[1]).unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientData { .. }));
    }

    #[test]
    fn test_baum_welch_skips_unvisited_state_rows() {
        let hmm = HiddenMarkovModel::default();
        let mut params = HmmParameters::default();
        params.initial = vec![1.0, 0.0, 0.0, 0.0];
        params.transition[0] = vec![1.0, 0.0, 0.0, 0.0];
        let report = hmm.baum_welch(&params, &[0, 0, 0, 0]).unwrap();
        assert_stochastic(&report.parameters);
    }

    #[test]
    fn test_predict_next_is_row_argmax() {
        let params = HmmParameters::default();
        assert_eq!(HiddenMarkovModel::predict_next(&params, 0), 0);
        assert_eq!(HiddenMarkovModel::predict_next(&params, 3), 3);
    }

    #[test]
    fn test_observe_retrains_on_interval() {
        let config = HmmConfig {
            retrain_interval: 5,
            min_training_length: 5,
            ..HmmConfig::default()
        };
        let hmm = HiddenMarkovModel::new(config);
        let mut state = hmm.initial_state();
        let mut retrained = false;
        for value in [40.0, 50.0, 60.0, 52.0, 58.0] {
            retrained = hmm.observe(&mut state, value).retrained;
        }
        assert!(retrained);
        assert_eq!(state.training_count, 1);
        assert_eq!(state.observations_since_training, 0);
        assert_stochastic(&state.parameters);
    }

    #[test]
    fn test_observe_rising_values_move_state_up() {
        let hmm = HiddenMarkovModel::default();
        let mut state = hmm.initial_state();
        let first = hmm.observe(&mut state, 40.0).state;
        let mut last = first;
        for value in [50.0, 50.0, 58.0, 60.0, 62.0, 64.0] {
            last = hmm.observe(&mut state, value).state;
        }
        assert!(last.index() > first.index());
    }

    #[test]
    fn test_history_bounded() {
        let config = HmmConfig {
            max_history: 10,
            retrain_interval: 1000,
            ..HmmConfig::default()
        };
        let hmm = HiddenMarkovModel::new(config);
        let mut state = hmm.initial_state();
        for i in 0..30 {
            hmm.observe(&mut state, i as f64 * 3.0);
        }
        assert_eq!(state.observation_history.len(), 10);
    }
}
