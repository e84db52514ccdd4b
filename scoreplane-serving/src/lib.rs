//! # Scoreplane Serving
//!
//! Serving and governance control plane for a risk-scoring model behind a
//! hybrid rule + model decision engine:
//!
//! - [`serving`]: hot-reloadable serving node
//! - [`routing`]: deterministic champion/challenger split
//! - [`drift`]: per-feature PSI drift detection
//! - [`monitoring`]: score-shift and latency SLA monitoring
//! - [`deploy`]: validation, promotion, rollback and the audit trail
//! - [`control`]: the facade a request-handling layer talks to

pub mod alerts;
pub mod audit;
pub mod config;
pub mod control;
pub mod deploy;
pub mod drift;
pub mod error;
pub mod hybrid;
pub mod model;
pub mod monitoring;
pub mod persistence;
pub mod registry;
pub mod routing;
pub mod serving;
pub mod snapshots;
pub mod stats;

pub use alerts::Severity;
pub use audit::{AuditTrail, DeploymentAction, DeploymentRecord};
pub use config::{ServingConfig, load_config};
pub use control::{ControlPlane, MonitoringReport, PredictResponse};
pub use deploy::{DeploymentPipeline, ValidationResult};
pub use drift::{DriftDetector, DriftReport, DriftStatus, ReferenceDistribution};
pub use error::{Result, ServingError};
pub use hybrid::{HybridDecision, HybridScorer, HybridStrategy, RiskTier};
pub use model::{FeatureVector, ScoringModel};
pub use monitoring::{Baseline, OutputMonitor};
pub use registry::{LocalRegistry, ModelArtifact, ModelRegistry, ModelStage, ModelVersion};
pub use routing::{RoutingConfig, TrafficRouter, Variant};
pub use serving::{LoadedModel, PredictionResult, ReloadOutcome, ServingNode};
pub use snapshots::SnapshotStore;
