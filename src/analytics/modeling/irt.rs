use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::analytics::error::{AnalyticsError, ConfigError};
use crate::analytics::types::DifficultyLevel;

const THETA_MIN: f64 = -3.0;
const THETA_MAX: f64 = 3.0;
const A_MIN: f64 = 0.5;
const A_MAX: f64 = 2.5;
const C_MAX: f64 = 0.3;
const PROB_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IrtModel {
    #[serde(rename = "1pl")]
    OneParameter,
    #[serde(rename = "2pl")]
    TwoParameter,
    #[default]
    #[serde(rename = "3pl")]
    ThreeParameter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrtConfig {
    pub model: IrtModel,
    pub scaling: f64,
    pub ability_iterations: usize,
    pub ability_tolerance: f64,
    pub min_ability_responses: usize,
    pub min_calibration_responses: usize,
    pub calibration_iterations: usize,
    pub calibration_rate: f64,
}

impl Default for IrtConfig {
    fn default() -> Self {
        Self {
            model: IrtModel::ThreeParameter,
            scaling: 1.0,
            ability_iterations: 25,
            ability_tolerance: 1e-4,
            min_ability_responses: 3,
            min_calibration_responses: 20,
            calibration_iterations: 200,
            calibration_rate: 0.05,
        }
    }
}

impl IrtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scaling > 0.0) {
            return Err(ConfigError::invalid("irt.scaling", "must be > 0"));
        }
        if self.ability_iterations == 0 || self.calibration_iterations == 0 {
            return Err(ConfigError::invalid("irt.iterations", "iteration caps must be > 0"));
        }
        if !(self.calibration_rate > 0.0) {
            return Err(ConfigError::invalid("irt.calibration_rate", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    /// `b`
    pub difficulty: f64,
    /// `a`
    pub discrimination: f64,
    /// `c`
    pub guessing: f64,
}

impl Default for ItemParameters {
    fn default() -> Self {
        Self {
            difficulty: 0.0,
            discrimination: 1.0,
            guessing: 0.0,
        }
    }
}

impl ItemParameters {
    pub fn new(difficulty: f64, discrimination: f64, guessing: f64) -> Self {
        Self {
            difficulty,
            discrimination,
            guessing,
        }
        .clamped()
    }

    pub fn from_difficulty_level(level: DifficultyLevel) -> Self {
        Self {
            difficulty: difficulty_to_irt(level),
            ..Self::default()
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            difficulty: self.difficulty.clamp(THETA_MIN, THETA_MAX),
            discrimination: self.discrimination.clamp(A_MIN, A_MAX),
            guessing: self.guessing.clamp(0.0, C_MAX),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemBankEntry {
    pub id: String,
    pub parameters: ItemParameters,
}

/// A scored response to a known item; `outcome` is the fraction correct in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoredResponse {
    pub item: ItemParameters,
    pub outcome: f64,
}

impl ScoredResponse {
    pub fn from_score(item: ItemParameters, score: f64) -> Self {
        Self {
            item,
            outcome: (score / 100.0).clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub ability: f64,
    pub outcome: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityEstimate {
    pub theta: f64,
    /// Infinite when the responses carry no information.
    pub standard_error: f64,
    pub information: f64,
    pub iterations: usize,
    pub converged: bool,
    pub insufficient_data: bool,
    pub response_count: usize,
}

impl AbilityEstimate {
    pub fn confidence(&self) -> f64 {
        if self.standard_error.is_finite() {
            1.0 / (1.0 + self.standard_error)
        } else {
            0.0
        }
    }
}

/// Persisted per-student ability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbilityState {
    pub theta: f64,
    pub standard_error: Option<f64>,
    pub response_count: usize,
    pub insufficient_data: bool,
    pub estimations: u32,
}

impl AbilityState {
    pub fn record(&mut self, estimate: &AbilityEstimate) {
        self.theta = estimate.theta;
        self.standard_error = estimate
            .standard_error
            .is_finite()
            .then_some(estimate.standard_error);
        self.response_count = estimate.response_count;
        self.insufficient_data = estimate.insufficient_data;
        self.estimations = self.estimations.saturating_add(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCalibration {
    pub parameters: ItemParameters,
    pub response_count: usize,
    pub iterations: usize,
    /// False when the item fell back to defaults for lack of responses.
    pub calibrated: bool,
}

pub fn difficulty_to_irt(level: DifficultyLevel) -> f64 {
    match level {
        DifficultyLevel::VeryEasy => -2.5,
        DifficultyLevel::Easy => -1.2,
        DifficultyLevel::Medium => 0.0,
        DifficultyLevel::Hard => 1.2,
        DifficultyLevel::VeryHard => 2.5,
    }
}

pub fn irt_to_difficulty(b: f64) -> DifficultyLevel {
    if b <= -2.0 {
        DifficultyLevel::VeryEasy
    } else if b <= -0.75 {
        DifficultyLevel::Easy
    } else if b < 0.75 {
        DifficultyLevel::Medium
    } else if b < 2.0 {
        DifficultyLevel::Hard
    } else {
        DifficultyLevel::VeryHard
    }
}

pub struct IrtCalibrator {
    config: IrtConfig,
}

impl Default for IrtCalibrator {
    fn default() -> Self {
        Self::new(IrtConfig::default())
    }
}

impl IrtCalibrator {
    pub fn new(config: IrtConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IrtConfig {
        &self.config
    }

    /// Item as seen by the configured model: 1PL fixes `a = 1, c = 0`, 2PL fixes `c = 0`.
    pub fn effective(&self, item: &ItemParameters) -> ItemParameters {
        let item = item.clamped();
        match self.config.model {
            IrtModel::OneParameter => ItemParameters {
                discrimination: 1.0,
                guessing: 0.0,
                ..item
            },
            IrtModel::TwoParameter => ItemParameters {
                guessing: 0.0,
                ..item
            },
            IrtModel::ThreeParameter => item,
        }
    }

    pub fn probability(&self, theta: f64, item: &ItemParameters) -> f64 {
        let item = self.effective(item);
        let p_star = self.logistic(theta, &item);
        item.guessing + (1.0 - item.guessing) * p_star
    }

    pub fn information(&self, theta: f64, item: &ItemParameters) -> f64 {
        let item = self.effective(item);
        let d = self.config.scaling;
        let a = item.discrimination;
        let c = item.guessing;
        let p = (c + (1.0 - c) * self.logistic(theta, &item)).clamp(PROB_EPS, 1.0 - PROB_EPS);
        let ratio = (p - c) / (1.0 - c);
        d * d * a * a * ratio * ratio * (1.0 - p) / p
    }

    pub fn test_information(&self, theta: f64, items: &[ItemParameters]) -> f64 {
        items.iter().map(|item| self.information(theta, item)).sum()
    }

    pub fn standard_error(information: f64) -> f64 {
        if information > 0.0 {
            1.0 / information.sqrt()
        } else {
            f64::INFINITY
        }
    }

    /// Newton–Raphson maximum likelihood estimate of ability.
    pub fn estimate_ability(&self, responses: &[ScoredResponse]) -> AbilityEstimate {
        let usable: Vec<ScoredResponse> = responses
            .iter()
            .filter(|r| r.outcome.is_finite())
            .map(|r| ScoredResponse {
                item: self.effective(&r.item),
                outcome: r.outcome.clamp(0.0, 1.0),
            })
            .collect();

        if usable.len() < self.config.min_ability_responses {
            return AbilityEstimate {
                theta: 0.0,
                standard_error: f64::INFINITY,
                information: 0.0,
                iterations: 0,
                converged: false,
                insufficient_data: true,
                response_count: usable.len(),
            };
        }

        let mut theta = 0.0;
        let mut iterations = 0;
        let mut converged = false;

        for _ in 0..self.config.ability_iterations {
            iterations += 1;
            let (first, second) = self.log_likelihood_derivatives(theta, &usable);

            let step = if second < -PROB_EPS {
                -first / second
            } else {
                // Non-concave region (3PL with guessing): fall back to Fisher scoring.
                let info: f64 = usable.iter().map(|r| self.information(theta, &r.item)).sum();
                if info > 0.0 {
                    first / info
                } else {
                    0.0
                }
            };
            if !step.is_finite() {
                break;
            }

            let next = (theta + step).clamp(THETA_MIN, THETA_MAX);
            let moved = (next - theta).abs();
            theta = next;
            if moved < self.config.ability_tolerance {
                converged = true;
                break;
            }
        }

        let items: Vec<ItemParameters> = usable.iter().map(|r| r.item).collect();
        let information = self.test_information(theta, &items);

        AbilityEstimate {
            theta,
            standard_error: Self::standard_error(information),
            information,
            iterations,
            converged,
            insufficient_data: false,
            response_count: usable.len(),
        }
    }

    /// Joint gradient ascent on `(b, a, c)` from pooled `(ability, outcome)` pairs.
    pub fn calibrate_item(
        &self,
        samples: &[CalibrationSample],
        initial: ItemParameters,
    ) -> ItemCalibration {
        let usable: Vec<CalibrationSample> = samples
            .iter()
            .filter(|s| s.ability.is_finite() && s.outcome.is_finite())
            .map(|s| CalibrationSample {
                ability: s.ability.clamp(THETA_MIN, THETA_MAX),
                outcome: s.outcome.clamp(0.0, 1.0),
            })
            .collect();

        if usable.len() < self.config.min_calibration_responses {
            return ItemCalibration {
                parameters: self.effective(&ItemParameters::default()),
                response_count: usable.len(),
                iterations: 0,
                calibrated: false,
            };
        }

        let n = usable.len() as f64;
        let d = self.config.scaling;
        let rate = self.config.calibration_rate;
        let mut item = self.effective(&initial);
        let mut iterations = 0;

        for _ in 0..self.config.calibration_iterations {
            iterations += 1;
            let (mut grad_b, mut grad_a, mut grad_c) = (0.0, 0.0, 0.0);

            for sample in &usable {
                let a = item.discrimination;
                let c = item.guessing;
                let p_star = self.logistic(sample.ability, &item);
                let p = (c + (1.0 - c) * p_star).clamp(PROB_EPS, 1.0 - PROB_EPS);
                let weight = (sample.outcome - p) / (p * (1.0 - p));
                let slope = (1.0 - c) * p_star * (1.0 - p_star);

                grad_b += weight * (-slope * d * a);
                grad_a += weight * slope * d * (sample.ability - item.difficulty);
                grad_c += weight * (1.0 - p_star);
            }

            let before = item;
            item.difficulty += rate * grad_b / n;
            match self.config.model {
                IrtModel::OneParameter => {}
                IrtModel::TwoParameter => item.discrimination += rate * grad_a / n,
                IrtModel::ThreeParameter => {
                    item.discrimination += rate * grad_a / n;
                    item.guessing += rate * grad_c / n;
                }
            }
            item = self.effective(&item);

            let moved = (item.difficulty - before.difficulty)
                .abs()
                .max((item.discrimination - before.discrimination).abs())
                .max((item.guessing - before.guessing).abs());
            if moved < 1e-7 {
                break;
            }
        }

        ItemCalibration {
            parameters: item,
            response_count: usable.len(),
            iterations,
            calibrated: true,
        }
    }

    /// Calibrates every item with enough responses; the rest keep default parameters.
    pub fn calibrate_bank(
        &self,
        responses: &BTreeMap<String, Vec<CalibrationSample>>,
    ) -> Result<BTreeMap<String, ItemCalibration>, AnalyticsError> {
        let required = self.config.min_calibration_responses;
        let best = responses.values().map(Vec::len).max().unwrap_or(0);
        if best < required {
            return Err(AnalyticsError::insufficient("irt_calibration", required, best));
        }

        Ok(responses
            .iter()
            .map(|(id, samples)| {
                (
                    id.clone(),
                    self.calibrate_item(samples, ItemParameters::default()),
                )
            })
            .collect())
    }

    /// Unseen item with maximum information at `theta`; ties go to the first.
    pub fn select_next_item<'a>(
        &self,
        theta: f64,
        bank: &'a [ItemBankEntry],
        administered: &HashSet<String>,
    ) -> Option<&'a ItemBankEntry> {
        let mut best: Option<(&ItemBankEntry, f64)> = None;
        for entry in bank.iter().filter(|e| !administered.contains(&e.id)) {
            let info = self.information(theta, &entry.parameters);
            match best {
                Some((_, best_info)) if info <= best_info => {}
                _ => best = Some((entry, info)),
            }
        }
        best.map(|(entry, _)| entry)
    }

    fn logistic(&self, theta: f64, item: &ItemParameters) -> f64 {
        let z = (self.config.scaling * item.discrimination * (theta - item.difficulty))
            .clamp(-30.0, 30.0);
        1.0 / (1.0 + (-z).exp())
    }

    fn log_likelihood_derivatives(&self, theta: f64, responses: &[ScoredResponse]) -> (f64, f64) {
        let d = self.config.scaling;
        let mut first = 0.0;
        let mut second = 0.0;
        for r in responses {
            let a = r.item.discrimination;
            let c = r.item.guessing;
            let u = r.outcome;
            let p = (c + (1.0 - c) * self.logistic(theta, &r.item))
                .clamp(PROB_EPS, 1.0 - PROB_EPS);
            let one_minus_c = 1.0 - c;

            first += d * a * (u - p) * (p - c) / (p * one_minus_c);
            second += d * d * a * a * (p - c) * (1.0 - p) * (u * c - p * p)
                / (p * p * one_minus_c * one_minus_c);
        }
        (first, second)
    }
}
