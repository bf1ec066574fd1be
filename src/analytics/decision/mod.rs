pub mod pid;
pub mod qlearning;

pub use pid::{AutotuneReport, PidConfig, PidDifficultyController, PidOutput, PidState, PidStatistics};
pub use qlearning::{
    ActionChoice, Experience, LearnOutcome, LearningContext, QLearningConfig, QLearningPolicy,
    QLearningState, QLearningStatistics, RewardBreakdown, TutorAction,
};
