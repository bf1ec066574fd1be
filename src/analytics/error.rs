use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0} ms")]
    Timeout(u64),
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient data for {component}: need {required}, have {actual}")]
    InsufficientData {
        component: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AnalyticsError {
    pub fn insufficient(component: &'static str, required: usize, actual: usize) -> Self {
        Self::InsufficientData {
            component,
            required,
            actual,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
