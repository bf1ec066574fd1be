pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod modeling;
pub mod persistence;
pub mod spi;
pub mod store;
pub mod types;

pub use config::AnalyticsConfig;
pub use engine::{ActionFeedback, AnalyticsEngine, DifficultyRecommendation};
pub use error::{AnalyticsError, ConfigError, StoreError};
pub use spi::{SpiComposer, SpiConfig, SpiResult};
pub use store::{
    AssessmentStore, InMemoryAssessmentStore, InMemoryModelStore, ModelKey, ModelKind, ModelStore,
};
pub use types::*;
