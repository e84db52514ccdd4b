//! Error types for the scoreplane-serving crate.

use thiserror::Error;

/// Top-level error type for serving and governance operations.
///
/// Every variant is local-recoverable: callers retry later (`ModelLoad`),
/// fix their input (`FeatureSchemaMismatch`, `InvalidRoutingConfig`) or fall
/// back to rule-only scoring (`Prediction`, which also covers timeouts).
#[derive(Debug, Error)]
pub enum ServingError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Feature schema mismatch: expected {expected:?}, got {actual:?}")]
    FeatureSchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Invalid routing config: {0}")]
    InvalidRoutingConfig(String),

    #[error("Validation failed for {name} v{version}: {failed_checks:?}")]
    ValidationFailed {
        name: String,
        version: u32,
        failed_checks: Vec<String>,
    },

    #[error("No archived version of '{0}' to roll back to")]
    NoArchivedVersion(String),

    #[error("Illegal stage transition for {name} v{version}: {from} -> {to}")]
    IllegalTransition {
        name: String,
        version: u32,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Not yet supported: {0}")]
    Unsupported(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ServingError {
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn prediction(msg: impl Into<String>) -> Self {
        Self::Prediction(msg.into())
    }

    pub fn invalid_routing(msg: impl Into<String>) -> Self {
        Self::InvalidRoutingConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn insufficient_data(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    /// Whether the caller should degrade to rule-only scoring rather than
    /// surface the error.
    pub fn is_fallback_signal(&self) -> bool {
        matches!(
            self,
            Self::Prediction(_) | Self::ModelLoad(_) | Self::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServingError>;
