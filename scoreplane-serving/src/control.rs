//! Control-plane facade: the operations a request-handling layer calls.
//!
//! Owns the champion and challenger serving nodes, the router between them,
//! one output monitor per variant, the shared drift detector and the
//! deployment pipeline. Everything is instance state; nothing is global.

use crate::audit::AuditTrail;
use crate::config::ServingConfig;
use crate::deploy::DeploymentPipeline;
use crate::drift::{DriftDetector, DriftReport};
use crate::error::{Result, ServingError};
use crate::hybrid::{HybridDecision, HybridScorer};
use crate::model::FeatureVector;
use crate::monitoring::{HealthReport, OutputMonitor};
use crate::registry::{ModelRegistry, ModelStage};
use crate::routing::{MetricsSummary, RoutingConfig, TrafficRouter, Variant};
use crate::serving::{NodeStatus, ReloadOutcome, ServingNode};
use crate::snapshots::SnapshotStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub score: f64,
    pub variant: Variant,
    pub latency_ms: f64,
    pub model_name: String,
    pub model_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingView {
    pub config: RoutingConfig,
    pub metrics: MetricsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusView {
    pub name: String,
    pub version: Option<u32>,
    pub loaded: bool,
    pub load_error: Option<String>,
}

impl From<NodeStatus> for ModelStatusView {
    fn from(status: NodeStatus) -> Self {
        Self {
            name: status.name,
            version: status.version,
            loaded: status.loaded,
            load_error: status.load_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    /// Champion model status.
    pub model: ModelStatusView,
    pub challenger: ModelStatusView,
    /// Champion output statistics.
    pub scores: HealthReport,
    pub challenger_scores: HealthReport,
    pub drift: DriftReport,
    pub routing: MetricsSummary,
    /// False while the emergency rules-only switch is engaged.
    pub ml_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct ControlPlane {
    config: ServingConfig,
    champion: Arc<ServingNode>,
    challenger: Arc<ServingNode>,
    router: Arc<TrafficRouter>,
    champion_monitor: Arc<OutputMonitor>,
    challenger_monitor: Arc<OutputMonitor>,
    drift: Arc<DriftDetector>,
    pipeline: DeploymentPipeline,
    hybrid: HybridScorer,
    ml_enabled: AtomicBool,
}

impl ControlPlane {
    pub fn new(
        config: ServingConfig,
        registry: Arc<dyn ModelRegistry>,
        audit: AuditTrail,
        snapshots: Option<SnapshotStore>,
    ) -> Result<Self> {
        let champion = Arc::new(ServingNode::new(Arc::clone(&registry), &config.model));

        let mut challenger_config = config.model.clone();
        challenger_config.stage = ModelStage::Staging;
        challenger_config.fallback_stage = None;
        let challenger = Arc::new(ServingNode::new(Arc::clone(&registry), &challenger_config));

        let router = Arc::new(TrafficRouter::with_nodes(
            &config.routing,
            Some(Arc::clone(&champion)),
            Some(Arc::clone(&challenger)),
        )?);
        let champion_monitor = Arc::new(OutputMonitor::new(config.monitoring.clone()));
        let challenger_monitor = Arc::new(OutputMonitor::new(config.monitoring.clone()));
        let drift = Arc::new(DriftDetector::new(
            &config.features.names(),
            config.drift.clone(),
        ));

        let mut pipeline = DeploymentPipeline::new(registry, &config, audit)
            .with_serving_node(Arc::clone(&champion))
            .with_monitor(Arc::clone(&champion_monitor))
            .with_challenger(
                Arc::clone(&challenger),
                Arc::clone(&challenger_monitor),
                Arc::clone(&router),
            )
            .with_drift(Arc::clone(&drift));
        if let Some(store) = snapshots {
            pipeline = pipeline.with_snapshots(store);
        }

        Ok(Self {
            hybrid: HybridScorer::new(config.hybrid.clone(), config.thresholds.clone()),
            ml_enabled: AtomicBool::new(config.hybrid.ml_enabled),
            config,
            champion,
            challenger,
            router,
            champion_monitor,
            challenger_monitor,
            drift,
            pipeline,
        })
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    pub fn champion(&self) -> &Arc<ServingNode> {
        &self.champion
    }

    pub fn challenger(&self) -> &Arc<ServingNode> {
        &self.challenger
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    pub fn drift(&self) -> &Arc<DriftDetector> {
        &self.drift
    }

    pub fn pipeline(&self) -> &DeploymentPipeline {
        &self.pipeline
    }

    pub fn hybrid(&self) -> &HybridScorer {
        &self.hybrid
    }

    /// Output monitor for `variant`. `Variant::None` has no monitor.
    pub fn monitor(&self, variant: Variant) -> Option<&Arc<OutputMonitor>> {
        match variant {
            Variant::Champion => Some(&self.champion_monitor),
            Variant::Challenger => Some(&self.challenger_monitor),
            Variant::None => None,
        }
    }

    /// Load both variants from their configured stages, then restore (or
    /// capture) the champion's baseline and drift references.
    pub async fn start(&self) -> (ReloadOutcome, ReloadOutcome) {
        let name = &self.config.model.name;
        let champion = self.champion.load(name, self.config.model.stage).await;
        let challenger = self.challenger.load(name, ModelStage::Staging).await;
        if let Some(version) = champion.model_version {
            self.pipeline.restore_serving_state(name, version).await;
        }
        info!(
            champion = ?champion.model_version,
            challenger = ?challenger.model_version,
            "Control plane started"
        );
        (champion, challenger)
    }

    /// Periodic hot-reload of both nodes until `cancel` fires.
    pub fn spawn_reload_loops(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = Duration::from_secs(self.config.model.reload_interval_secs.max(1));
        vec![
            Arc::clone(&self.champion).spawn_reload_loop(interval, cancel.child_token()),
            Arc::clone(&self.challenger).spawn_reload_loop(interval, cancel.child_token()),
        ]
    }

    /// Build a vector in the configured feature order; missing features
    /// default to 0.0.
    pub fn features_from_map(&self, map: &HashMap<String, f64>) -> FeatureVector {
        FeatureVector::ordered(&self.config.features.names(), map)
    }

    /// Route, score and record one request.
    pub async fn predict(&self, entity_id: &str, features: &FeatureVector) -> Result<PredictResponse> {
        let decision = self.router.route(entity_id, features).await?;
        let Some(prediction) = decision.prediction else {
            return Err(ServingError::prediction("no model loaded for any variant"));
        };

        if let Some(monitor) = self.monitor(decision.variant) {
            monitor.record_prediction(prediction.score, prediction.latency_ms);
        }
        self.drift.record_vector(features);

        Ok(PredictResponse {
            score: prediction.score,
            variant: decision.variant,
            latency_ms: prediction.latency_ms,
            model_name: prediction.model_name,
            model_version: prediction.model_version,
        })
    }

    /// Hybrid decision for one event; any model failure degrades to the rule
    /// score alone.
    pub async fn score_event(
        &self,
        entity_id: &str,
        rule_score: f64,
        features: &FeatureVector,
    ) -> HybridDecision {
        let ml_score = if self.ml_enabled() {
            match self.predict(entity_id, features).await {
                Ok(response) => Some(response.score),
                Err(e) => {
                    if e.is_fallback_signal() {
                        debug!(entity_id, error = %e, "Model unavailable, using rule score");
                    } else {
                        warn!(entity_id, error = %e, "Model rejected request, using rule score");
                    }
                    None
                }
            }
        } else {
            None
        };
        self.hybrid.combine(rule_score, ml_score)
    }

    /// Whether events are scored with the model at all.
    pub fn ml_enabled(&self) -> bool {
        self.hybrid.config().ml_enabled && self.ml_enabled.load(Ordering::SeqCst)
    }

    /// Emergency switch to rules-only scoring, for when no archived version
    /// is left to roll back to. Re-enabling has no effect if ML scoring is
    /// disabled in the configuration.
    pub fn set_ml_enabled(&self, enabled: bool) {
        self.ml_enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("ML scoring re-enabled");
        } else {
            warn!("ML scoring disabled, scoring with rules only");
        }
    }

    /// Reload both nodes; the result reports the champion.
    ///
    /// A champion version change (e.g. a promotion made by another process)
    /// brings its baseline and references along, and ends the experiment if
    /// the challenger was serving that version.
    pub async fn reload(&self) -> ReloadOutcome {
        let previous = self.champion.current().map(|m| m.version);
        let challenger = self.challenger.reload().await;
        if !challenger.success {
            debug!(error = ?challenger.error, "Challenger reload failed");
        }
        let outcome = self.champion.reload().await;
        if let Some(version) = outcome.model_version
            && previous != Some(version)
        {
            let name = &self.config.model.name;
            self.pipeline.restore_serving_state(name, version).await;
            self.pipeline.conclude_experiment(name, version);
        }
        outcome
    }

    /// Set drift references from training vectors and persist them with
    /// the serving champion version. Returns the number of features set.
    pub fn set_reference_sample(&self, rows: &[FeatureVector]) -> Result<usize> {
        let count = self.drift.set_references_from_vectors(rows);
        if let Some(model) = self.champion.current() {
            self.pipeline.persist_references(&model.name, model.version)?;
        }
        Ok(count)
    }

    pub fn get_routing(&self) -> RoutingView {
        RoutingView {
            config: self.router.config(),
            metrics: self.router.metrics_summary(),
        }
    }

    pub fn set_routing(&self, config: RoutingConfig) -> Result<RoutingConfig> {
        self.router.update_config(config)
    }

    pub fn reset_routing(&self) {
        self.router.reset();
    }

    pub fn get_monitoring_report(&self) -> MonitoringReport {
        MonitoringReport {
            model: self.champion.status().into(),
            challenger: self.challenger.status().into(),
            scores: self.champion_monitor.health_report(),
            challenger_scores: self.challenger_monitor.health_report(),
            drift: self.drift.drift_report(),
            routing: self.router.metrics_summary(),
            ml_enabled: self.ml_enabled(),
            timestamp: Utc::now(),
        }
    }
}
