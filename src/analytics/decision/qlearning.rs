use std::collections::{BTreeMap, VecDeque};

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::analytics::error::ConfigError;
use crate::analytics::types::{AssessmentObservation, DifficultyLevel};

pub const ACTION_COUNT: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningConfig {
    pub learning_rate: f64,
    pub discount: f64,
    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub buffer_capacity: usize,
    pub replay_interval: u64,
    pub replay_batch: usize,
    pub pass_threshold: f64,
    pub reward: RewardWeights,
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount: 0.9,
            epsilon: 0.3,
            epsilon_min: 0.05,
            epsilon_decay: 0.995,
            buffer_capacity: 1000,
            replay_interval: 10,
            replay_batch: 32,
            pass_threshold: 60.0,
            reward: RewardWeights::default(),
        }
    }
}

impl QLearningConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.learning_rate && self.learning_rate <= 1.0) {
            return Err(ConfigError::invalid("qlearning.learning_rate", "must lie in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.discount) {
            return Err(ConfigError::invalid("qlearning.discount", "must lie in [0, 1]"));
        }
        if !(0.0 <= self.epsilon_min && self.epsilon_min <= self.epsilon && self.epsilon <= 1.0) {
            return Err(ConfigError::invalid(
                "qlearning.epsilon",
                "need 0 <= epsilon_min <= epsilon <= 1",
            ));
        }
        if !(0.0 < self.epsilon_decay && self.epsilon_decay <= 1.0) {
            return Err(ConfigError::invalid("qlearning.epsilon_decay", "must lie in (0, 1]"));
        }
        if self.buffer_capacity == 0 || self.replay_interval == 0 {
            return Err(ConfigError::invalid(
                "qlearning.replay",
                "buffer capacity and replay interval must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardWeights {
    pub score_delta: f64,
    pub pass_bonus: f64,
    pub fail_penalty: f64,
    pub streak_length: usize,
    pub streak_bonus: f64,
    pub fast_seconds: f64,
    pub slow_seconds: f64,
    pub time_bonus: f64,
    pub optimal_band: (f64, f64),
    pub optimal_bonus: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            score_delta: 1.0,
            pass_bonus: 0.5,
            fail_penalty: 0.5,
            streak_length: 3,
            streak_bonus: 0.3,
            fast_seconds: 300.0,
            slow_seconds: 1200.0,
            time_bonus: 0.1,
            optimal_band: (60.0, 80.0),
            optimal_bonus: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TutorAction {
    DecreaseDifficulty,
    MaintainDifficulty,
    IncreaseDifficulty,
    ChangeType,
    RepeatSimilar,
    TakeBreak,
}

impl TutorAction {
    pub const ALL: [TutorAction; ACTION_COUNT] = [
        Self::DecreaseDifficulty,
        Self::MaintainDifficulty,
        Self::IncreaseDifficulty,
        Self::ChangeType,
        Self::RepeatSimilar,
        Self::TakeBreak,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::DecreaseDifficulty => 0,
            Self::MaintainDifficulty => 1,
            Self::IncreaseDifficulty => 2,
            Self::ChangeType => 3,
            Self::RepeatSimilar => 4,
            Self::TakeBreak => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecreaseDifficulty => "decrease_difficulty",
            Self::MaintainDifficulty => "maintain_difficulty",
            Self::IncreaseDifficulty => "increase_difficulty",
            Self::ChangeType => "change_type",
            Self::RepeatSimilar => "repeat_similar",
            Self::TakeBreak => "take_break",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceBucket {
    Low,
    Developing,
    Target,
    High,
}

impl PerformanceBucket {
    pub fn from_score(score: f64) -> Self {
        if score < 40.0 {
            Self::Low
        } else if score < 60.0 {
            Self::Developing
        } else if score < 80.0 {
            Self::Target
        } else {
            Self::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Developing => "developing",
            Self::Target => "target",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendTag {
    Up,
    Down,
    Flat,
}

impl TrendTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningContext {
    pub performance: PerformanceBucket,
    pub difficulty: DifficultyLevel,
    pub fatigued: bool,
    pub trend: TrendTag,
}

impl Default for LearningContext {
    fn default() -> Self {
        Self {
            performance: PerformanceBucket::Developing,
            difficulty: DifficultyLevel::Medium,
            fatigued: false,
            trend: TrendTag::Flat,
        }
    }
}

impl LearningContext {
    /// Buckets the most recent attempts; `history` is time ordered, oldest first.
    pub fn from_history(history: &[AssessmentObservation]) -> Self {
        let Some(last) = history.last() else {
            return Self::default();
        };

        let tail: Vec<f64> = history
            .iter()
            .rev()
            .take(3)
            .map(|o| o.clamped_score())
            .collect();
        let trend = if tail.len() < 3 {
            TrendTag::Flat
        } else {
            // `tail` is newest first.
            let delta = tail[0] - tail[2];
            if delta > 5.0 {
                TrendTag::Up
            } else if delta < -5.0 {
                TrendTag::Down
            } else {
                TrendTag::Flat
            }
        };

        let window_start = last.timestamp - Duration::minutes(60);
        let recent_attempts = history
            .iter()
            .filter(|o| o.timestamp >= window_start && o.timestamp <= last.timestamp)
            .count();
        let fatigued = last.time_taken > 1800.0 || recent_attempts >= 5;

        Self {
            performance: PerformanceBucket::from_score(last.clamped_score()),
            difficulty: last.difficulty(),
            fatigued,
            trend,
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.performance.as_str(),
            self.difficulty.as_str(),
            if self.fatigued { "fatigued" } else { "rested" },
            self.trend.as_str()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub score_delta: f64,
    pub pass_fail: f64,
    pub streak: f64,
    pub time: f64,
    pub optimal_band: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: String,
    pub action: TutorAction,
    pub reward: f64,
    pub next_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningState {
    pub table: BTreeMap<String, [f64; ACTION_COUNT]>,
    pub epsilon: f64,
    pub steps: u64,
    #[serde(default)]
    pub buffer: VecDeque<Experience>,
}

impl QLearningState {
    pub fn from_config(config: &QLearningConfig) -> Self {
        Self {
            table: BTreeMap::new(),
            epsilon: config.epsilon,
            steps: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn q(&self, state: &str, action: TutorAction) -> f64 {
        self.table
            .get(state)
            .map_or(0.0, |row| row[action.index()])
    }

    pub fn max_q(&self, state: &str) -> f64 {
        self.table
            .get(state)
            .map_or(0.0, |row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
    }
}

impl Default for QLearningState {
    fn default() -> Self {
        Self::from_config(&QLearningConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionChoice {
    pub action: TutorAction,
    pub state: String,
    pub q_value: f64,
    pub explored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnOutcome {
    pub td_error: f64,
    pub q_value: f64,
    pub epsilon: f64,
    pub replayed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub action: TutorAction,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningStatistics {
    pub epsilon: f64,
    pub visited_states: usize,
    pub steps: u64,
    pub buffer_size: usize,
    pub policy: BTreeMap<String, PolicyEntry>,
}

pub struct QLearningPolicy {
    config: QLearningConfig,
}

impl Default for QLearningPolicy {
    fn default() -> Self {
        Self::new(QLearningConfig::default())
    }
}

impl QLearningPolicy {
    pub fn new(config: QLearningConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QLearningConfig {
        &self.config
    }

    pub fn initial_state(&self) -> QLearningState {
        QLearningState::from_config(&self.config)
    }

    /// Greedy action; ties go to the first action in enumeration order.
    pub fn greedy(&self, q: &QLearningState, state: &str) -> (TutorAction, f64) {
        let mut best = TutorAction::ALL[0];
        let mut best_value = q.q(state, best);
        for action in TutorAction::ALL.iter().skip(1) {
            let value = q.q(state, *action);
            if value > best_value {
                best = *action;
                best_value = value;
            }
        }
        (best, best_value)
    }

    pub fn select_action<R: Rng>(
        &self,
        q: &QLearningState,
        context: &LearningContext,
        rng: &mut R,
    ) -> ActionChoice {
        let state = context.key();
        if rng.random::<f64>() < q.epsilon {
            let action = TutorAction::ALL[rng.random_range(0..ACTION_COUNT)];
            return ActionChoice {
                q_value: q.q(&state, action),
                action,
                state,
                explored: true,
            };
        }
        let (action, q_value) = self.greedy(q, &state);
        ActionChoice {
            action,
            state,
            q_value,
            explored: false,
        }
    }

    pub fn reward(
        &self,
        history: &[AssessmentObservation],
        outcome: &AssessmentObservation,
    ) -> RewardBreakdown {
        let w = &self.config.reward;
        let score = outcome.clamped_score();

        let score_delta = history
            .last()
            .map_or(0.0, |prev| (score - prev.clamped_score()) / 100.0 * w.score_delta);

        let passed = score >= self.config.pass_threshold;
        let pass_fail = if passed { w.pass_bonus } else { -w.fail_penalty };

        let run = 1 + history
            .iter()
            .rev()
            .take_while(|o| (o.clamped_score() >= self.config.pass_threshold) == passed)
            .count();
        let streak = if run >= w.streak_length {
            if passed {
                w.streak_bonus
            } else {
                -w.streak_bonus
            }
        } else {
            0.0
        };

        let time = if !(outcome.time_taken > 0.0) {
            0.0
        } else if outcome.time_taken < w.fast_seconds {
            w.time_bonus
        } else if outcome.time_taken > w.slow_seconds {
            -w.time_bonus
        } else {
            0.0
        };

        let optimal_band = if (w.optimal_band.0..=w.optimal_band.1).contains(&score) {
            w.optimal_bonus
        } else {
            0.0
        };

        RewardBreakdown {
            score_delta,
            pass_fail,
            streak,
            time,
            optimal_band,
            total: score_delta + pass_fail + streak + time + optimal_band,
        }
    }

    /// One TD update, buffer push, periodic replay and ε decay.
    pub fn learn<R: Rng>(
        &self,
        q: &mut QLearningState,
        experience: Experience,
        rng: &mut R,
    ) -> LearnOutcome {
        let td_error = self.apply(q, &experience);
        let q_value = q.q(&experience.state, experience.action);

        q.buffer.push_back(experience);
        while q.buffer.len() > self.config.buffer_capacity {
            q.buffer.pop_front();
        }
        q.steps = q.steps.saturating_add(1);

        let mut replayed = 0;
        if q.steps % self.config.replay_interval == 0 {
            replayed = self.replay(q, rng);
        }

        q.epsilon = (q.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);

        LearnOutcome {
            td_error,
            q_value,
            epsilon: q.epsilon,
            replayed,
        }
    }

    /// Samples without replacement from the buffer and reapplies the update.
    pub fn replay<R: Rng>(&self, q: &mut QLearningState, rng: &mut R) -> usize {
        let amount = self.config.replay_batch.min(q.buffer.len());
        if amount == 0 {
            return 0;
        }
        let batch: Vec<Experience> = rand::seq::index::sample(rng, q.buffer.len(), amount)
            .into_iter()
            .filter_map(|idx| q.buffer.get(idx).cloned())
            .collect();
        for experience in &batch {
            self.apply(q, experience);
        }
        batch.len()
    }

    pub fn policy(&self, q: &QLearningState) -> BTreeMap<String, PolicyEntry> {
        q.table
            .keys()
            .map(|state| {
                let (action, value) = self.greedy(q, state);
                (state.clone(), PolicyEntry { action, value })
            })
            .collect()
    }

    pub fn statistics(&self, q: &QLearningState) -> QLearningStatistics {
        QLearningStatistics {
            epsilon: q.epsilon,
            visited_states: q.table.len(),
            steps: q.steps,
            buffer_size: q.buffer.len(),
            policy: self.policy(q),
        }
    }

    fn apply(&self, q: &mut QLearningState, experience: &Experience) -> f64 {
        if !experience.reward.is_finite() {
            return 0.0;
        }
        let current = q.q(&experience.state, experience.action);
        let target = experience.reward + self.config.discount * q.max_q(&experience.next_state);
        let td_error = target - current;
        let row = q
            .table
            .entry(experience.state.clone())
            .or_insert([0.0; ACTION_COUNT]);
        row[experience.action.index()] = current + self.config.learning_rate * td_error;
        td_error
    }
}
