use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analytics::decision::{PidConfig, QLearningConfig};
use crate::analytics::error::ConfigError;
use crate::analytics::modeling::irt::IrtModel;
use crate::analytics::modeling::{
    AttentionConfig, BayesianConfig, DistributionConfig, HmmConfig, IrtConfig, KalmanConfig,
    MetaConfig,
};
use crate::analytics::spi::SpiConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub kalman: KalmanConfig,
    pub hmm: HmmConfig,
    pub competency_hmm: HmmConfig,
    pub bayesian: BayesianConfig,
    pub distribution: DistributionConfig,
    pub pid: PidConfig,
    pub qlearning: QLearningConfig,
    pub irt: IrtConfig,
    pub attention: AttentionConfig,
    pub meta: MetaConfig,
    pub spi: SpiConfig,
    pub store_timeout_ms: u64,
    /// Idle per-student locks are pruned once the table grows past this size.
    pub lock_prune_threshold: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            kalman: KalmanConfig::default(),
            hmm: HmmConfig::default(),
            competency_hmm: HmmConfig::competency_default(),
            bayesian: BayesianConfig::default(),
            distribution: DistributionConfig::default(),
            pid: PidConfig::default(),
            qlearning: QLearningConfig::default(),
            irt: IrtConfig::default(),
            attention: AttentionConfig::default(),
            meta: MetaConfig::default(),
            spi: SpiConfig::default(),
            store_timeout_ms: 2000,
            lock_prune_threshold: 1024,
        }
    }
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = env_parse("SPI_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = val;
        }
        if let Some(val) = env_parse("SPI_HISTORY_WINDOW") {
            config.spi.window = val;
        }
        if let Some(val) = env_parse("SPI_KALMAN_PROCESS_NOISE") {
            config.kalman.process_noise = val;
        }
        if let Some(val) = env_parse("SPI_KALMAN_MEASUREMENT_NOISE") {
            config.kalman.measurement_noise = val;
        }
        if let Some(val) = env_parse("SPI_PID_SETPOINT") {
            config.pid.setpoint = val;
        }
        if let Some(val) = env_parse("SPI_PID_KP") {
            config.pid.kp = val;
        }
        if let Some(val) = env_parse("SPI_PID_KI") {
            config.pid.ki = val;
        }
        if let Some(val) = env_parse("SPI_PID_KD") {
            config.pid.kd = val;
        }
        if let Some(val) = env_parse("SPI_QLEARNING_EPSILON") {
            config.qlearning.epsilon = val;
        }
        if let Ok(val) = std::env::var("SPI_IRT_MODEL") {
            config.irt.model = match val.trim().to_lowercase().as_str() {
                "1pl" => IrtModel::OneParameter,
                "2pl" => IrtModel::TwoParameter,
                _ => IrtModel::ThreeParameter,
            };
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kalman.validate()?;
        self.hmm.validate()?;
        self.competency_hmm.validate()?;
        self.bayesian.validate()?;
        self.distribution.validate()?;
        self.pid.validate()?;
        self.qlearning.validate()?;
        self.irt.validate()?;
        self.attention.validate()?;
        self.meta.validate()?;
        self.spi.validate()?;
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("store_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse().ok())
}
