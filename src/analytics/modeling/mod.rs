pub mod attention;
pub mod bayesian;
pub mod hmm;
pub mod irt;
pub mod kalman;
pub mod meta;

pub use attention::{
    AttentionConfig, AttentionContext, AttentionFocusScorer, AttentionModel, AttentionOutput,
    ContextValue, HistoricalRecord,
};
pub use bayesian::{
    BayesianConfig, BayesianMasteryTracker, BeliefRecord, DistributionConfig, DistributionRecord,
    DistributionSummary, MasteryDistributionTracker, MasteryLevel,
};
pub use hmm::{HiddenMarkovModel, HmmConfig, HmmOutput, HmmParameters, HmmState, HmmStatistics};
pub use irt::{
    AbilityEstimate, AbilityState, CalibrationSample, IrtCalibrator, IrtConfig, IrtModel,
    ItemBankEntry, ItemCalibration, ItemParameters, ScoredResponse,
};
pub use kalman::{KalmanConfig, KalmanOutput, KalmanSmoother, KalmanState, KalmanStatistics};
pub use meta::{DetectedPattern, MetaConfig, MetaFeatures, MetaLearner, MetaSample, MetaState};
