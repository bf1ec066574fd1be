//! Per-concept mastery beliefs.
//!
//! [`BayesianMasteryTracker`] keeps the scalar belief that feeds the SPI.
//! [`MasteryDistributionTracker`] is a separate reporting view holding a full
//! low / medium / high distribution per competency; the two are updated from
//! the same observations but never reconciled with each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analytics::error::ConfigError;
use crate::analytics::types::{AssessmentObservation, DifficultyLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayesianConfig {
    pub prior_mastery: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub success_threshold: f64,
    pub min_mastery: f64,
    pub max_mastery: f64,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            prior_mastery: 0.3,
            success_rate: 0.15,
            failure_rate: 0.10,
            success_threshold: 70.0,
            min_mastery: 0.05,
            max_mastery: 0.95,
        }
    }
}

impl BayesianConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.min_mastery && self.min_mastery < self.max_mastery && self.max_mastery < 1.0)
        {
            return Err(ConfigError::invalid(
                "bayesian.bounds",
                "need 0 < min_mastery < max_mastery < 1",
            ));
        }
        if !(self.min_mastery..=self.max_mastery).contains(&self.prior_mastery) {
            return Err(ConfigError::invalid(
                "bayesian.prior_mastery",
                "prior must lie within the mastery bounds",
            ));
        }
        if !(0.0 < self.success_rate && self.success_rate < 1.0)
            || !(0.0 < self.failure_rate && self.failure_rate < 1.0)
        {
            return Err(ConfigError::invalid(
                "bayesian.rates",
                "success and failure rates must lie in (0, 1)",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptBelief {
    pub mastery: f64,
    pub attempts: u32,
    pub successes: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeliefRecord {
    pub concepts: BTreeMap<String, ConceptBelief>,
}

impl BeliefRecord {
    pub fn mastery_map(&self) -> BTreeMap<String, f64> {
        self.concepts
            .iter()
            .map(|(concept, belief)| (concept.clone(), belief.mastery))
            .collect()
    }

    pub fn mastery(&self, concept: &str) -> Option<f64> {
        self.concepts.get(concept).map(|b| b.mastery)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryUpdate {
    pub concept: String,
    pub before: f64,
    pub after: f64,
    pub success: bool,
}

pub struct BayesianMasteryTracker {
    config: BayesianConfig,
}

impl Default for BayesianMasteryTracker {
    fn default() -> Self {
        Self::new(BayesianConfig::default())
    }
}

impl BayesianMasteryTracker {
    pub fn new(config: BayesianConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BayesianConfig {
        &self.config
    }

    pub fn is_success(&self, score: f64) -> bool {
        score >= self.config.success_threshold
    }

    pub fn update_mastery(&self, mastery: f64, success: bool) -> f64 {
        let next = if success {
            mastery + self.config.success_rate * (1.0 - mastery)
        } else {
            mastery - self.config.failure_rate * mastery
        };
        next.clamp(self.config.min_mastery, self.config.max_mastery)
    }

    pub fn observe(
        &self,
        record: &mut BeliefRecord,
        observation: &AssessmentObservation,
    ) -> Vec<MasteryUpdate> {
        let success = self.is_success(observation.clamped_score());
        let ts = observation.timestamp.timestamp_millis();

        observation
            .concepts()
            .into_iter()
            .map(|concept| {
                let belief = record
                    .concepts
                    .entry(concept.clone())
                    .or_insert_with(|| ConceptBelief {
                        mastery: self.config.prior_mastery,
                        attempts: 0,
                        successes: 0,
                        updated_at: ts,
                    });
                let before = belief.mastery;
                belief.mastery = self.update_mastery(before, success);
                belief.attempts = belief.attempts.saturating_add(1);
                if success {
                    belief.successes = belief.successes.saturating_add(1);
                }
                belief.updated_at = ts;

                MasteryUpdate {
                    concept,
                    before,
                    after: belief.mastery,
                    success,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasteryLevel {
    Low,
    Medium,
    High,
}

impl MasteryLevel {
    pub const ALL: [MasteryLevel; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GaussianEvidence {
    pub mean: f64,
    pub std_dev: f64,
}

impl GaussianEvidence {
    pub const fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }

    pub fn pdf(&self, x: f64) -> f64 {
        let sd = self.std_dev.max(1e-9);
        let z = (x - self.mean) / sd;
        (-0.5 * z * z).exp() / (sd * (2.0 * std::f64::consts::PI).sqrt())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyMultipliers {
    pub easy: [f64; 3],
    pub medium: [f64; 3],
    pub hard: [f64; 3],
}

impl Default for DifficultyMultipliers {
    fn default() -> Self {
        Self {
            easy: [1.0, 1.0, 0.8],
            medium: [1.0, 1.0, 1.0],
            hard: [0.8, 1.0, 1.2],
        }
    }
}

impl DifficultyMultipliers {
    pub fn row(&self, difficulty: DifficultyLevel) -> [f64; 3] {
        match difficulty {
            DifficultyLevel::VeryEasy | DifficultyLevel::Easy => self.easy,
            DifficultyLevel::Medium => self.medium,
            DifficultyLevel::Hard | DifficultyLevel::VeryHard => self.hard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub score_evidence: [GaussianEvidence; 3],
    /// Seconds; skipped when an observation carries no time.
    pub time_evidence: [GaussianEvidence; 3],
    pub difficulty: DifficultyMultipliers,
    pub blend_rate: f64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            score_evidence: [
                GaussianEvidence::new(40.0, 15.0),
                GaussianEvidence::new(65.0, 12.0),
                GaussianEvidence::new(88.0, 8.0),
            ],
            time_evidence: [
                GaussianEvidence::new(900.0, 300.0),
                GaussianEvidence::new(600.0, 240.0),
                GaussianEvidence::new(420.0, 180.0),
            ],
            difficulty: DifficultyMultipliers::default(),
            blend_rate: 0.3,
        }
    }
}

impl DistributionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.blend_rate && self.blend_rate <= 1.0) {
            return Err(ConfigError::invalid("distribution.blend_rate", "must lie in (0, 1]"));
        }
        let all_evidence = self.score_evidence.iter().chain(self.time_evidence.iter());
        for evidence in all_evidence {
            if !(evidence.std_dev > 0.0) {
                return Err(ConfigError::invalid(
                    "distribution.evidence",
                    "standard deviations must be > 0",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryDistribution {
    pub probabilities: [f64; 3],
    pub observations: u32,
}

impl Default for MasteryDistribution {
    fn default() -> Self {
        Self {
            probabilities: [1.0 / 3.0; 3],
            observations: 0,
        }
    }
}

impl MasteryDistribution {
    pub fn most_likely(&self) -> MasteryLevel {
        let mut best = 0;
        for idx in 1..3 {
            if self.probabilities[idx] > self.probabilities[best] {
                best = idx;
            }
        }
        MasteryLevel::ALL[best]
    }

    pub fn confidence(&self) -> f64 {
        self.probabilities.iter().copied().fold(0.0, f64::max)
    }

    pub fn entropy(&self) -> f64 {
        -self
            .probabilities
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| p * p.log2())
            .sum::<f64>()
    }

    pub fn entropy_confidence(&self) -> f64 {
        (1.0 - self.entropy() / 3f64.log2()).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub competencies: BTreeMap<String, MasteryDistribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub competency: String,
    pub level: MasteryLevel,
    pub probabilities: [f64; 3],
    pub confidence: f64,
    pub entropy: f64,
    pub entropy_confidence: f64,
}

impl DistributionSummary {
    fn from_distribution(competency: &str, dist: &MasteryDistribution) -> Self {
        Self {
            competency: competency.to_string(),
            level: dist.most_likely(),
            probabilities: dist.probabilities,
            confidence: dist.confidence(),
            entropy: dist.entropy(),
            entropy_confidence: dist.entropy_confidence(),
        }
    }
}

impl DistributionRecord {
    pub fn summaries(&self) -> Vec<DistributionSummary> {
        self.competencies
            .iter()
            .map(|(name, dist)| DistributionSummary::from_distribution(name, dist))
            .collect()
    }
}

pub struct MasteryDistributionTracker {
    config: DistributionConfig,
}

impl Default for MasteryDistributionTracker {
    fn default() -> Self {
        Self::new(DistributionConfig::default())
    }
}

impl MasteryDistributionTracker {
    pub fn new(config: DistributionConfig) -> Self {
        Self { config }
    }

    pub fn likelihood(&self, observation: &AssessmentObservation) -> [f64; 3] {
        let score = observation.clamped_score();
        let multipliers = self.config.difficulty.row(observation.difficulty());
        let use_time = observation.time_taken.is_finite() && observation.time_taken > 0.0;

        let mut likelihood = [0.0; 3];
        for (idx, value) in likelihood.iter_mut().enumerate() {
            let mut l = self.config.score_evidence[idx].pdf(score);
            if use_time {
                l *= self.config.time_evidence[idx].pdf(observation.time_taken);
            }
            *value = l * multipliers[idx];
        }
        likelihood
    }

    /// Bayes update blended with the prior; a degenerate likelihood leaves the prior untouched.
    pub fn update(&self, dist: &mut MasteryDistribution, likelihood: &[f64; 3]) -> bool {
        let mut posterior = [0.0; 3];
        for idx in 0..3 {
            posterior[idx] = dist.probabilities[idx] * likelihood[idx];
        }
        let total: f64 = posterior.iter().sum();
        if !(total > 0.0) || !total.is_finite() {
            tracing::debug!("skipping degenerate mastery distribution update");
            return false;
        }

        let rate = self.config.blend_rate;
        for idx in 0..3 {
            dist.probabilities[idx] =
                (1.0 - rate) * dist.probabilities[idx] + rate * posterior[idx] / total;
        }
        let sum: f64 = dist.probabilities.iter().sum();
        for p in dist.probabilities.iter_mut() {
            *p /= sum;
        }
        dist.observations = dist.observations.saturating_add(1);
        true
    }

    pub fn observe(
        &self,
        record: &mut DistributionRecord,
        observation: &AssessmentObservation,
    ) -> Vec<DistributionSummary> {
        let likelihood = self.likelihood(observation);
        observation
            .concepts()
            .into_iter()
            .map(|competency| {
                let dist = record.competencies.entry(competency.clone()).or_default();
                self.update(dist, &likelihood);
                DistributionSummary::from_distribution(&competency, dist)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn obs(score: f64) -> AssessmentObservation {
        AssessmentObservation::new("s1", score, Utc::now()).with_competencies(["fractions"])
    }

    #[test]
    fn test_successes_increase_toward_upper_bound() {
        let tracker = BayesianMasteryTracker::default();
        let mut m = tracker.config().prior_mastery;
        for _ in 0..200 {
            let next = tracker.update_mastery(m, true);
            assert!(next >= m);
            if m < tracker.config().max_mastery {
                assert!(next > m);
            }
            assert!(next <= 0.95);
            m = next;
        }
    }

    #[test]
    fn test_failures_decrease_toward_lower_bound() {
        let tracker = BayesianMasteryTracker::default();
        let mut m = 0.9;
        for _ in 0..200 {
            let next = tracker.update_mastery(m, false);
            assert!(next <= m);
            if m > tracker.config().min_mastery {
                assert!(next < m);
            }
            assert!(next >= 0.05);
            m = next;
        }
    }

    #[test]
    fn test_success_threshold_is_inclusive() {
        let tracker = BayesianMasteryTracker::default();
        assert!(tracker.is_success(70.0));
        assert!(!tracker.is_success(69.9));
    }

    #[test]
    fn test_observe_updates_every_competency() {
        let tracker = BayesianMasteryTracker::default();
        let mut record = BeliefRecord::default();
        let observation = obs(90.0).with_competencies(["algebra", "geometry"]);
        let updates = tracker.observe(&mut record, &observation);
        assert_eq!(updates.len(), 2);
        assert!(record.mastery("algebra").unwrap() > 0.3);
        assert_eq!(record.concepts["geometry"].successes, 1);
    }

    #[test]
    fn test_observe_without_competency_uses_general() {
        let tracker = BayesianMasteryTracker::default();
        let mut record = BeliefRecord::default();
        tracker.observe(&mut record, &AssessmentObservation::new("s1", 20.0, Utc::now()));
        assert!(record.mastery("general").unwrap() < 0.3);
    }

    #[test]
    fn test_distribution_sums_to_one() {
        let tracker = MasteryDistributionTracker::default();
        let mut record = DistributionRecord::default();
        for score in [30.0, 95.0, 60.0, 88.0] {
            tracker.observe(&mut record, &obs(score).with_time_taken(500.0));
        }
        let dist = &record.competencies["fractions"];
        assert!((dist.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(dist.observations, 4);
    }

    #[test]
    fn test_high_scores_shift_distribution_up() {
        let tracker = MasteryDistributionTracker::default();
        let mut record = DistributionRecord::default();
        for _ in 0..10 {
            tracker.observe(&mut record, &obs(92.0).with_time_taken(400.0));
        }
        let summary = &record.summaries()[0];
        assert_eq!(summary.level, MasteryLevel::High);
        assert!(summary.confidence > 0.5);
        assert!(summary.entropy_confidence > 0.0);
    }

    #[test]
    fn test_blend_softens_single_observation() {
        let tracker = MasteryDistributionTracker::default();
        let mut dist = MasteryDistribution::default();
        let likelihood = tracker.likelihood(&obs(98.0));
        tracker.update(&mut dist, &likelihood);
        assert!(dist.probabilities[2] < 0.3 + 1.0 / 3.0);
    }

    #[test]
    fn test_degenerate_likelihood_keeps_prior() {
        let tracker = MasteryDistributionTracker::default();
        let mut dist = MasteryDistribution::default();
        assert!(!tracker.update(&mut dist, &[0.0, 0.0, 0.0]));
        assert_eq!(dist.observations, 0);
        assert_eq!(dist.probabilities, [1.0 / 3.0; 3]);
    }

    #[test]
    fn test_uniform_entropy_is_maximal() {
        let dist = MasteryDistribution::default();
        assert!((dist.entropy() - 3f64.log2()).abs() < 1e-12);
        assert!(dist.entropy_confidence() < 1e-12);
    }
}
