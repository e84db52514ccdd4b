//! Model version registry: the narrow interface the control plane uses to
//! find, fetch, register and re-stage model artifacts.
//!
//! The registry owns [`ModelVersion`] records. Only the deployment pipeline
//! calls [`ModelRegistry::transition_stage`]; every other component reads.

mod local;

pub use local::LocalRegistry;

use crate::error::{Result, ServingError};
use crate::model::ScoringModel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle stage of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelStage {
    None,
    Staging,
    Production,
    Archived,
}

impl ModelStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Staging => "Staging",
            Self::Production => "Production",
            Self::Archived => "Archived",
        }
    }

    /// Legal edges of the lifecycle:
    ///
    /// ```text
    /// None -> Staging -> Production -> Archived
    ///            |                      |   ^
    ///            +------> Archived      +---+ (rollback: Archived -> Production)
    /// ```
    pub fn can_transition_to(self, to: ModelStage) -> bool {
        matches!(
            (self, to),
            (Self::None, Self::Staging)
                | (Self::Staging, Self::Production)
                | (Self::Staging, Self::Archived)
                | (Self::Production, Self::Archived)
                | (Self::Archived, Self::Production)
        )
    }
}

impl std::fmt::Display for ModelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelStage {
    type Err = ServingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            other => Err(ServingError::Config(format!("unknown model stage '{other}'"))),
        }
    }
}

/// Immutable training metadata recorded at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub dataset_hash: String,
    /// Ordered feature names the model was trained on.
    pub feature_list: Vec<String>,
    pub trained_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl TrainingMetadata {
    pub fn new(feature_list: Vec<String>) -> Self {
        Self {
            feature_list,
            trained_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_dataset(mut self, dataset: &[u8]) -> Self {
        self.dataset_hash = dataset_hash(dataset);
        self
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// One trained artifact in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    /// Monotonically increasing per `name`, starting at 1.
    pub version: u32,
    pub stage: ModelStage,
    /// Opaque handle resolved by [`ModelRegistry::fetch_model`].
    pub artifact_reference: String,
    pub metadata: TrainingMetadata,
    pub registered_at: DateTime<Utc>,
    pub stage_updated_at: DateTime<Utc>,
}

/// Serializable model definitions the local registry can materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelArtifact {
    /// `sigmoid(bias + Σ weights[i] · x[i])`.
    Logistic { weights: Vec<f64>, bias: f64 },
    /// Returns `score` for every input.
    Constant { score: f64 },
}

/// Narrow registry interface consumed by the serving subsystem.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Highest version of `name` currently at `stage`.
    async fn load(&self, name: &str, stage: ModelStage) -> Result<ModelVersion>;

    /// A specific version regardless of stage.
    async fn get(&self, name: &str, version: u32) -> Result<ModelVersion>;

    /// Materialize the predict function for a version.
    async fn fetch_model(&self, version: &ModelVersion) -> Result<Arc<dyn ScoringModel>>;

    /// Register a new version of `name` in stage `None`.
    async fn register(
        &self,
        name: &str,
        artifact: ModelArtifact,
        metadata: TrainingMetadata,
    ) -> Result<ModelVersion>;

    /// Move a version along one edge of the lifecycle.
    async fn transition_stage(
        &self,
        name: &str,
        version: u32,
        new_stage: ModelStage,
    ) -> Result<ModelVersion>;

    /// All versions of `name`, optionally filtered by stage, ascending by version.
    async fn list_versions(&self, name: &str, stage: Option<ModelStage>)
    -> Result<Vec<ModelVersion>>;
}

/// SHA-256 hex digest of a training dataset, for reproducibility tracking.
pub fn dataset_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
