//! Per-student orchestration of the analytics components.
//!
//! Every operation follows load-or-initialize, apply one update, persist. All
//! read-modify-write sequences for a student run under that student's lock.
//! Store failures on the update paths are logged and skipped; the batch and
//! query entry points surface them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::analytics::config::AnalyticsConfig;
use crate::analytics::decision::{
    ActionChoice, AutotuneReport, Experience, LearnOutcome, LearningContext, PidDifficultyController,
    PidState, PidStatistics, QLearningPolicy, QLearningState, QLearningStatistics, RewardBreakdown,
    TutorAction,
};
use crate::analytics::error::{AnalyticsError, Result, StoreError};
use crate::analytics::metrics::{ComponentId, ComponentRegistry, ComponentStatus};
use crate::analytics::modeling::attention::AttentionStatistics;
use crate::analytics::modeling::irt::difficulty_to_irt;
use crate::analytics::modeling::meta::MetaUpdate;
use crate::analytics::modeling::{
    AbilityEstimate, AbilityState, AttentionContext, AttentionFocusScorer, AttentionModel,
    AttentionOutput, BayesianMasteryTracker, BeliefRecord, CalibrationSample, DistributionRecord,
    DistributionSummary, HiddenMarkovModel, HistoricalRecord, HmmState, HmmStatistics,
    IrtCalibrator, ItemBankEntry, ItemCalibration, KalmanSmoother, KalmanState, KalmanStatistics,
    MasteryDistributionTracker, MetaFeatures, MetaLearner, MetaSample, MetaState, ScoredResponse,
};
use crate::analytics::persistence::{with_timeout, ModelRepository, StudentLocks, Versioned};
use crate::analytics::spi::{SpiComposer, SpiResult};
use crate::analytics::store::{AssessmentStore, ModelKey, ModelKind, ModelStore};
use crate::analytics::types::{AssessmentObservation, DifficultyLevel, ModelStatus, SpiHistoryEntry};
use crate::track_component;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyRecommendation {
    pub multiplier: f64,
    pub level: DifficultyLevel,
    /// IRT `b` for the recommended level.
    pub irt_difficulty: f64,
    pub error: f64,
    pub held: bool,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFeedback {
    pub state: String,
    pub next_state: String,
    pub reward: RewardBreakdown,
    pub learned: LearnOutcome,
}

/// A loaded (or freshly initialized) record. `live` is false when the store
/// could not be read; such a slot is computed on but never written back.
struct Slot<T> {
    key: ModelKey,
    value: T,
    version: Option<u64>,
    live: bool,
}

impl<T> Slot<T> {
    fn as_live(&mut self) -> Option<&mut T> {
        if self.live {
            Some(&mut self.value)
        } else {
            None
        }
    }
}

pub struct AnalyticsEngine<A, M> {
    config: AnalyticsConfig,
    assessments: Arc<A>,
    repository: ModelRepository<M>,
    locks: StudentLocks,
    metrics: ComponentRegistry,
    rng: parking_lot::Mutex<StdRng>,
    kalman: KalmanSmoother,
    hmm: HiddenMarkovModel,
    competency_hmm: HiddenMarkovModel,
    bayesian: BayesianMasteryTracker,
    distribution: MasteryDistributionTracker,
    pid: PidDifficultyController,
    qlearning: QLearningPolicy,
    irt: IrtCalibrator,
    attention: AttentionFocusScorer,
    meta: MetaLearner,
    spi: SpiComposer,
}

impl<A: AssessmentStore, M: ModelStore> AnalyticsEngine<A, M> {
    pub fn new(config: AnalyticsConfig, assessments: Arc<A>, models: Arc<M>) -> Result<Self> {
        Self::with_rng(config, assessments, models, StdRng::from_os_rng())
    }

    /// Deterministic exploration and adaptation.
    pub fn with_seed(
        config: AnalyticsConfig,
        assessments: Arc<A>,
        models: Arc<M>,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(config, assessments, models, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: AnalyticsConfig,
        assessments: Arc<A>,
        models: Arc<M>,
        rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = Duration::from_millis(config.store_timeout_ms);
        tracing::info!(
            store_timeout_ms = config.store_timeout_ms,
            window = config.spi.window,
            "analytics engine initialized"
        );

        Ok(Self {
            assessments,
            repository: ModelRepository::new(models, timeout),
            locks: StudentLocks::new(config.lock_prune_threshold),
            metrics: ComponentRegistry::new(),
            rng: parking_lot::Mutex::new(rng),
            kalman: KalmanSmoother::new(config.kalman.clone()),
            hmm: HiddenMarkovModel::new(config.hmm.clone()),
            competency_hmm: HiddenMarkovModel::new(config.competency_hmm.clone()),
            bayesian: BayesianMasteryTracker::new(config.bayesian.clone()),
            distribution: MasteryDistributionTracker::new(config.distribution.clone()),
            pid: PidDifficultyController::new(config.pid.clone()),
            qlearning: QLearningPolicy::new(config.qlearning.clone()),
            irt: IrtCalibrator::new(config.irt.clone()),
            attention: AttentionFocusScorer::new(config.attention.clone()),
            meta: MetaLearner::new(config.meta.clone()),
            spi: SpiComposer::new(config.spi.clone(), config.kalman.clone(), config.hmm.clone()),
            config,
        })
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn metrics(&self) -> Vec<ComponentStatus> {
        self.metrics.snapshot()
    }

    // ==================== Trigger hook ====================

    /// Rewrites the derived records after an assessment has been evaluated and
    /// stored. Each record is independent; a failed one is skipped.
    pub async fn on_assessment_evaluated(
        &self,
        observation: &AssessmentObservation,
    ) -> Result<SpiResult> {
        validate_observation(observation)?;
        let student_id = observation.student_id.as_str();
        let _guard = self.locks.acquire(student_id).await;

        let mut degraded = Vec::new();
        let mastery = self.update_beliefs(observation, &mut degraded).await;
        self.update_distribution(observation, &mut degraded).await;
        self.update_competency_states(observation, &mut degraded).await;

        let mut scores: Vec<f64> = match self
            .recent_assessments(student_id, Some(self.config.spi.window))
            .await
        {
            Ok(history) => history.iter().map(|o| o.clamped_score()).collect(),
            Err(err) => {
                tracing::warn!(student_id, error = %err, "assessment history unavailable");
                degraded.push("assessments".to_string());
                Vec::new()
            }
        };
        if scores.is_empty() {
            scores.push(observation.clamped_score());
        }

        let mut kalman = self
            .checkout(ModelKey::new(student_id, ModelKind::Kalman), || {
                self.kalman.initial_state()
            })
            .await;
        let mut hmm = self
            .checkout(ModelKey::new(student_id, ModelKind::Hmm), || {
                self.hmm.initial_state()
            })
            .await;

        let mut result = track_component!(
            self.metrics,
            ComponentId::Spi,
            self.spi.compose(
                student_id,
                &scores,
                kalman.as_live(),
                hmm.as_live(),
                mastery,
            )
        );

        if kalman.live && !kalman.value.estimate.is_finite() {
            self.metrics.record_error(ComponentId::Kalman);
            tracing::warn!(student_id, "non-finite spi estimate; kalman state not persisted");
            degraded.push(ModelKind::Kalman.to_string());
        } else if kalman.live && !self.commit(&kalman).await {
            degraded.push(ModelKind::Kalman.to_string());
        }
        if hmm.live && !self.commit(&hmm).await {
            degraded.push(ModelKind::Hmm.to_string());
        }

        if let Err(err) = self.repository.append_history(result.to_history_entry()).await {
            self.metrics.record_error(ComponentId::Store);
            tracing::warn!(student_id, error = %err, "failed to append spi history");
            degraded.push("spi_history".to_string());
        }

        for name in degraded {
            if !result.degraded.contains(&name) {
                result.degraded.push(name);
            }
        }
        tracing::debug!(
            student_id,
            spi = result.spi,
            learning_state = %result.learning_state,
            degraded = result.degraded.len(),
            "spi updated"
        );
        Ok(result)
    }

    async fn update_beliefs(
        &self,
        observation: &AssessmentObservation,
        degraded: &mut Vec<String>,
    ) -> Option<BTreeMap<String, f64>> {
        let key = ModelKey::new(observation.student_id.as_str(), ModelKind::Belief);
        let mut slot = self.checkout(key, BeliefRecord::default).await;
        let record = slot.as_live()?;

        let updates = track_component!(
            self.metrics,
            ComponentId::Bayesian,
            self.bayesian.observe(record, observation)
        );
        tracing::debug!(
            student_id = %observation.student_id,
            concepts = updates.len(),
            "mastery beliefs updated"
        );

        let mastery = slot.value.mastery_map();
        if !self.commit(&slot).await {
            degraded.push(ModelKind::Belief.to_string());
        }
        Some(mastery)
    }

    async fn update_distribution(
        &self,
        observation: &AssessmentObservation,
        degraded: &mut Vec<String>,
    ) {
        let key = ModelKey::new(observation.student_id.as_str(), ModelKind::BeliefDistribution);
        let mut slot = self.checkout(key, DistributionRecord::default).await;
        let Some(record) = slot.as_live() else {
            degraded.push(ModelKind::BeliefDistribution.to_string());
            return;
        };
        track_component!(
            self.metrics,
            ComponentId::BeliefDistribution,
            self.distribution.observe(record, observation)
        );
        if !self.commit(&slot).await {
            degraded.push(ModelKind::BeliefDistribution.to_string());
        }
    }

    async fn update_competency_states(
        &self,
        observation: &AssessmentObservation,
        degraded: &mut Vec<String>,
    ) {
        let score = observation.clamped_score();
        let mut failed = false;
        for concept in observation.concepts() {
            let key = ModelKey::scoped(
                observation.student_id.as_str(),
                ModelKind::CompetencyHmm,
                concept,
            );
            let mut slot = self
                .checkout(key, || self.competency_hmm.initial_state())
                .await;
            let Some(state) = slot.as_live() else {
                failed = true;
                continue;
            };
            track_component!(
                self.metrics,
                ComponentId::CompetencyHmm,
                self.competency_hmm.observe(state, score)
            );
            failed |= !self.commit(&slot).await;
        }
        if failed {
            degraded.push(ModelKind::CompetencyHmm.to_string());
        }
    }

    // ==================== SPI ====================

    /// Computes the SPI from current state without persisting anything.
    pub async fn compose_spi(&self, student_id: &str) -> Result<SpiResult> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;

        let mut degraded = Vec::new();
        let scores: Vec<f64> = match self
            .recent_assessments(student_id, Some(self.config.spi.window))
            .await
        {
            Ok(history) => history.iter().map(|o| o.clamped_score()).collect(),
            Err(err) => {
                tracing::warn!(student_id, error = %err, "assessment history unavailable");
                degraded.push("assessments".to_string());
                Vec::new()
            }
        };

        let mut kalman = self
            .checkout(ModelKey::new(student_id, ModelKind::Kalman), || {
                self.kalman.initial_state()
            })
            .await;
        let mut hmm = self
            .checkout(ModelKey::new(student_id, ModelKind::Hmm), || {
                self.hmm.initial_state()
            })
            .await;
        let beliefs = self
            .checkout(ModelKey::new(student_id, ModelKind::Belief), BeliefRecord::default)
            .await;
        let mastery = beliefs.live.then(|| beliefs.value.mastery_map());

        let mut result = track_component!(
            self.metrics,
            ComponentId::Spi,
            self.spi
                .compose(student_id, &scores, kalman.as_live(), hmm.as_live(), mastery)
        );
        result.degraded.extend(degraded);
        Ok(result)
    }

    pub async fn spi_history(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SpiHistoryEntry>> {
        validate_student(student_id)?;
        Ok(self.repository.history(student_id, limit).await?)
    }

    // ==================== Difficulty (PID) ====================

    pub async fn recommend_difficulty(
        &self,
        student_id: &str,
        score: f64,
    ) -> Result<DifficultyRecommendation> {
        validate_student(student_id)?;
        validate_score(score)?;
        let _guard = self.locks.acquire(student_id).await;

        let mut slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Pid), || {
                self.pid.initial_state()
            })
            .await;
        let output = track_component!(
            self.metrics,
            ComponentId::Pid,
            self.pid.update(&mut slot.value, score)
        );
        let persisted = self.commit(&slot).await;

        tracing::debug!(
            student_id,
            multiplier = output.multiplier,
            level = output.level.as_str(),
            held = output.held,
            "difficulty recommended"
        );
        Ok(DifficultyRecommendation {
            multiplier: output.multiplier,
            level: output.level,
            irt_difficulty: difficulty_to_irt(output.level),
            error: output.error,
            held: output.held,
            persisted,
        })
    }

    pub async fn autotune_difficulty_controller(&self, student_id: &str) -> Result<AutotuneReport> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;

        let key = ModelKey::new(student_id, ModelKind::Pid);
        let Some(Versioned { mut value, version }) = self.repository.load::<PidState>(&key).await?
        else {
            return Err(AnalyticsError::insufficient(
                "pid_autotune",
                self.config.pid.min_autotune_samples,
                0,
            ));
        };

        let report = track_component!(self.metrics, ComponentId::Pid, self.pid.autotune(&mut value))
            .inspect_err(|_| self.metrics.record_error(ComponentId::Pid))?;
        self.repository.save(&key, &value, version).await?;

        tracing::info!(
            student_id,
            kp = report.kp,
            ki = report.ki,
            kd = report.kd,
            "difficulty controller autotuned"
        );
        Ok(report)
    }

    pub async fn reset_difficulty_controller(&self, student_id: &str) -> Result<()> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;
        self.overwrite(
            &ModelKey::new(student_id, ModelKind::Pid),
            &self.pid.initial_state(),
        )
        .await
    }

    pub async fn difficulty_statistics(
        &self,
        student_id: &str,
    ) -> Result<ModelStatus<PidStatistics>> {
        self.query(student_id, ModelKind::Pid, |state: PidState| {
            self.pid.statistics(&state)
        })
        .await
    }

    // ==================== Tutoring policy (Q-learning) ====================

    pub async fn recommend_action(&self, student_id: &str) -> Result<ActionChoice> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;

        let history = self.history_or_empty(student_id).await;
        let context = LearningContext::from_history(&history);
        let slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Qtable), || {
                self.qlearning.initial_state()
            })
            .await;

        let choice = track_component!(self.metrics, ComponentId::QLearning, {
            let mut rng = self.rng.lock();
            self.qlearning.select_action(&slot.value, &context, &mut *rng)
        });
        tracing::debug!(
            student_id,
            action = choice.action.as_str(),
            state = %choice.state,
            explored = choice.explored,
            "tutoring action selected"
        );
        Ok(choice)
    }

    /// Applies the outcome of `action`; the state is the context before the
    /// outcome and the next state the context including it.
    pub async fn learn_from_outcome(
        &self,
        student_id: &str,
        action: TutorAction,
        outcome: &AssessmentObservation,
    ) -> Result<ActionFeedback> {
        validate_student(student_id)?;
        validate_observation(outcome)?;
        if outcome.student_id != student_id {
            return Err(AnalyticsError::Validation(format!(
                "outcome belongs to {}, not {student_id}",
                outcome.student_id
            )));
        }
        let _guard = self.locks.acquire(student_id).await;

        let mut before = self.history_or_empty(student_id).await;
        before.retain(|o| o.timestamp < outcome.timestamp);
        let state = LearningContext::from_history(&before).key();
        let reward = self.qlearning.reward(&before, outcome);
        before.push(outcome.clone());
        let next_state = LearningContext::from_history(&before).key();

        let mut slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Qtable), || {
                self.qlearning.initial_state()
            })
            .await;
        let experience = Experience {
            state: state.clone(),
            action,
            reward: reward.total,
            next_state: next_state.clone(),
        };
        let learned = track_component!(self.metrics, ComponentId::QLearning, {
            let mut rng = self.rng.lock();
            self.qlearning.learn(&mut slot.value, experience, &mut *rng)
        });
        self.commit(&slot).await;

        Ok(ActionFeedback {
            state,
            next_state,
            reward,
            learned,
        })
    }

    pub async fn policy_statistics(
        &self,
        student_id: &str,
    ) -> Result<ModelStatus<QLearningStatistics>> {
        self.query(student_id, ModelKind::Qtable, |state: QLearningState| {
            self.qlearning.statistics(&state)
        })
        .await
    }

    // ==================== Item response theory ====================

    /// Estimates and records ability. An estimate without enough responses
    /// never overwrites an existing one.
    pub async fn estimate_ability(
        &self,
        student_id: &str,
        responses: &[ScoredResponse],
    ) -> Result<AbilityEstimate> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;

        let estimate = track_component!(
            self.metrics,
            ComponentId::Irt,
            self.irt.estimate_ability(responses)
        );
        let mut slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Irt), AbilityState::default)
            .await;
        if !(estimate.insufficient_data && slot.version.is_some()) {
            slot.value.record(&estimate);
            self.commit(&slot).await;
        }
        Ok(estimate)
    }

    /// Most informative unseen item at the recorded ability (0 when unknown).
    pub async fn next_item(
        &self,
        student_id: &str,
        bank: &[ItemBankEntry],
        administered: &HashSet<String>,
    ) -> Result<Option<ItemBankEntry>> {
        validate_student(student_id)?;
        let ability = self
            .checkout(ModelKey::new(student_id, ModelKind::Irt), AbilityState::default)
            .await;
        Ok(track_component!(
            self.metrics,
            ComponentId::Irt,
            self.irt
                .select_next_item(ability.value.theta, bank, administered)
                .cloned()
        ))
    }

    pub fn calibrate_items(
        &self,
        responses: &BTreeMap<String, Vec<CalibrationSample>>,
    ) -> Result<BTreeMap<String, ItemCalibration>> {
        track_component!(self.metrics, ComponentId::Irt, self.irt.calibrate_bank(responses))
            .inspect_err(|_| self.metrics.record_error(ComponentId::Irt))
    }

    pub async fn ability_statistics(&self, student_id: &str) -> Result<ModelStatus<AbilityState>> {
        self.query(student_id, ModelKind::Irt, |state: AbilityState| state)
            .await
    }

    // ==================== Attention ====================

    /// Attention-weighted expectation of past outcomes for `query`; `None`
    /// when the student has no history.
    pub async fn predict_contextual_score(
        &self,
        student_id: &str,
        query: &AttentionContext,
    ) -> Result<Option<AttentionOutput>> {
        validate_student(student_id)?;
        let history: Vec<HistoricalRecord> = self
            .history_or_empty(student_id)
            .await
            .iter()
            .map(HistoricalRecord::from_observation)
            .collect();
        let model = self
            .checkout(
                ModelKey::new(student_id, ModelKind::Attention),
                AttentionModel::default,
            )
            .await;
        Ok(track_component!(
            self.metrics,
            ComponentId::Attention,
            self.attention.attend(&model.value, query, &history)
        ))
    }

    pub async fn reinforce_attention(
        &self,
        student_id: &str,
        context: &AttentionContext,
        reward: f64,
    ) -> Result<()> {
        validate_student(student_id)?;
        if !reward.is_finite() {
            return Err(AnalyticsError::Validation(format!("reward {reward} is not finite")));
        }
        let _guard = self.locks.acquire(student_id).await;

        let mut slot = self
            .checkout(
                ModelKey::new(student_id, ModelKind::Attention),
                AttentionModel::default,
            )
            .await;
        track_component!(self.metrics, ComponentId::Attention, {
            let mut rng = self.rng.lock();
            self.attention
                .adapt(&mut slot.value, context, reward, &mut *rng)
        });
        self.commit(&slot).await;
        Ok(())
    }

    pub async fn attention_statistics(
        &self,
        student_id: &str,
    ) -> Result<ModelStatus<AttentionStatistics>> {
        self.query(student_id, ModelKind::Attention, |model: AttentionModel| {
            self.attention.statistics(&model)
        })
        .await
    }

    // ==================== Meta-learning ====================

    pub async fn learn_meta(&self, observation: &AssessmentObservation) -> Result<MetaUpdate> {
        validate_observation(observation)?;
        let student_id = observation.student_id.as_str();
        let _guard = self.locks.acquire(student_id).await;

        let mut slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Meta), || {
                self.meta.initial_state()
            })
            .await;
        let sample = MetaSample {
            features: MetaFeatures::from_observation(observation),
            performance: observation.clamped_score() / 100.0,
            hour: observation.hour_of_day(),
        };
        let update = track_component!(
            self.metrics,
            ComponentId::Meta,
            self.meta.learn(&mut slot.value, sample)
        );
        self.commit(&slot).await;

        if !update.patterns.is_empty() {
            tracing::debug!(student_id, patterns = update.patterns.len(), "meta patterns detected");
        }
        Ok(update)
    }

    /// Expected performance in `[0, 1]` for a planned assessment.
    pub async fn predict_performance(
        &self,
        student_id: &str,
        features: &MetaFeatures,
    ) -> Result<f64> {
        validate_student(student_id)?;
        let slot = self
            .checkout(ModelKey::new(student_id, ModelKind::Meta), || {
                self.meta.initial_state()
            })
            .await;
        Ok(track_component!(
            self.metrics,
            ComponentId::Meta,
            self.meta.predict(&slot.value, features)
        ))
    }

    pub async fn meta_statistics(&self, student_id: &str) -> Result<ModelStatus<MetaState>> {
        self.query(student_id, ModelKind::Meta, |state: MetaState| state)
            .await
    }

    // ==================== Queries ====================

    pub async fn competency_states(
        &self,
        student_id: &str,
    ) -> Result<BTreeMap<String, HmmStatistics>> {
        validate_student(student_id)?;
        let records: Vec<(Option<String>, HmmState)> = self
            .repository
            .list(student_id, ModelKind::CompetencyHmm)
            .await?;
        Ok(records
            .into_iter()
            .filter_map(|(scope, state)| {
                scope.map(|concept| (concept, self.competency_hmm.statistics(&state)))
            })
            .collect())
    }

    pub async fn kalman_statistics(
        &self,
        student_id: &str,
    ) -> Result<ModelStatus<KalmanStatistics>> {
        self.query(student_id, ModelKind::Kalman, |state: KalmanState| {
            self.kalman.statistics(&state)
        })
        .await
    }

    pub async fn hmm_statistics(&self, student_id: &str) -> Result<ModelStatus<HmmStatistics>> {
        self.query(student_id, ModelKind::Hmm, |state: HmmState| {
            self.hmm.statistics(&state)
        })
        .await
    }

    pub async fn belief_statistics(&self, student_id: &str) -> Result<ModelStatus<BeliefRecord>> {
        self.query(student_id, ModelKind::Belief, |record: BeliefRecord| record)
            .await
    }

    pub async fn mastery_distribution(
        &self,
        student_id: &str,
    ) -> Result<ModelStatus<Vec<DistributionSummary>>> {
        self.query(
            student_id,
            ModelKind::BeliefDistribution,
            |record: DistributionRecord| record.summaries(),
        )
        .await
    }

    pub async fn reset_kalman(&self, student_id: &str) -> Result<()> {
        validate_student(student_id)?;
        let _guard = self.locks.acquire(student_id).await;
        self.overwrite(
            &ModelKey::new(student_id, ModelKind::Kalman),
            &self.kalman.initial_state(),
        )
        .await
    }

    // ==================== Store plumbing ====================

    async fn recent_assessments(
        &self,
        student_id: &str,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<AssessmentObservation>, StoreError> {
        let history = track_component!(
            self.metrics,
            ComponentId::Store,
            with_timeout(
                self.repository.timeout(),
                self.assessments.recent_assessments(student_id, limit),
            )
            .await
        );
        history.inspect_err(|_| self.metrics.record_error(ComponentId::Store))
    }

    async fn history_or_empty(&self, student_id: &str) -> Vec<AssessmentObservation> {
        match self
            .recent_assessments(student_id, Some(self.config.spi.window))
            .await
        {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(student_id, error = %err, "assessment history unavailable");
                Vec::new()
            }
        }
    }

    async fn checkout<T, F>(&self, key: ModelKey, init: F) -> Slot<T>
    where
        T: DeserializeOwned,
        F: Fn() -> T,
    {
        let loaded = track_component!(
            self.metrics,
            ComponentId::Store,
            self.repository.load_or_init(&key, &init).await
        );
        match loaded {
            Ok(Versioned { value, version }) => Slot {
                key,
                value,
                version,
                live: true,
            },
            Err(err) => {
                self.metrics.record_error(ComponentId::Store);
                tracing::warn!(key = %key, error = %err, "model load failed; using fresh state");
                Slot {
                    key,
                    value: init(),
                    version: None,
                    live: false,
                }
            }
        }
    }

    /// Writes a live slot back; false when skipped or failed.
    async fn commit<T: Serialize>(&self, slot: &Slot<T>) -> bool {
        if !slot.live {
            return false;
        }
        let saved = track_component!(
            self.metrics,
            ComponentId::Store,
            self.repository.save(&slot.key, &slot.value, slot.version).await
        );
        match saved {
            Ok(_) => true,
            Err(err) => {
                self.metrics.record_error(ComponentId::Store);
                tracing::warn!(key = %slot.key, error = %err, "model save failed; update skipped");
                false
            }
        }
    }

    async fn overwrite<T: Serialize>(&self, key: &ModelKey, value: &T) -> Result<()> {
        let current = self.repository.load::<serde_json::Value>(key).await?;
        self.repository
            .save(key, value, current.and_then(|c| c.version))
            .await?;
        tracing::info!(key = %key, "model reset");
        Ok(())
    }

    async fn query<T, S, F>(&self, student_id: &str, kind: ModelKind, view: F) -> Result<ModelStatus<S>>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> S,
    {
        validate_student(student_id)?;
        let loaded = self
            .repository
            .load::<T>(&ModelKey::new(student_id, kind))
            .await?;
        Ok(loaded.map(|v| view(v.value)).into())
    }
}

fn validate_student(student_id: &str) -> Result<()> {
    if student_id.trim().is_empty() {
        return Err(AnalyticsError::Validation("student id must not be empty".into()));
    }
    Ok(())
}

fn validate_score(score: f64) -> Result<()> {
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(AnalyticsError::Validation(format!(
            "score {score} outside [0, 100]"
        )));
    }
    Ok(())
}

fn validate_observation(observation: &AssessmentObservation) -> Result<()> {
    validate_student(&observation.student_id)?;
    validate_score(observation.score)?;
    if !observation.time_taken.is_finite() || observation.time_taken < 0.0 {
        return Err(AnalyticsError::Validation(format!(
            "time taken {} must be finite and >= 0",
            observation.time_taken
        )));
    }
    Ok(())
}
