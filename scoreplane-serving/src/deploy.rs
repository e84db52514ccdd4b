//! Deployment pipeline: validation gate, promotion, rollback and the stage
//! transitions around them.
//!
//! Every stage change goes through one critical section, so two concurrent
//! promotions can never leave two versions in Production, and every public
//! operation appends exactly one [`DeploymentRecord`], success or failure.

use crate::audit::{AuditTrail, DeploymentAction, DeploymentRecord, NewRecord};
use crate::config::{DeploymentConfig, FeatureKind, FeatureSpec, ServingConfig};
use crate::drift::DriftDetector;
use crate::error::{Result, ServingError};
use crate::model::FeatureVector;
use crate::monitoring::{Baseline, OutputMonitor};
use crate::registry::{ModelRegistry, ModelStage};
use crate::routing::TrafficRouter;
use crate::serving::ServingNode;
use crate::snapshots::SnapshotStore;
use crate::stats;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const CHECK_MODEL_LOADS: &str = "model_loads";
pub const CHECK_SCORES_VALID: &str = "scores_valid";
pub const CHECK_SCORES_IN_RANGE: &str = "scores_in_range";
pub const CHECK_LATENCY_WITHIN_SLA: &str = "latency_within_sla";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub num_events_tested: usize,
    /// Fraction of finite scores, in [0, 1].
    pub valid_score_pct: f64,
    /// Mean over finite scores.
    pub mean_score: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    /// Last prediction error seen, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_error: Option<String>,
}

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: BTreeMap<String, bool>,
    pub details: ValidationDetails,
    pub latency_sla_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Deterministic synthetic evaluation set.
///
/// One vector per event, in `order`. Each feature is drawn uniformly from its
/// configured range (integers for `Int` features); features missing from
/// `spec` are drawn from [0, 1].
pub fn synthetic_events(
    order: &[String],
    spec: &FeatureSpec,
    count: usize,
    seed: u64,
) -> Vec<FeatureVector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let values = order
                .iter()
                .map(|name| match spec.get(name) {
                    Some(def) => {
                        let (lo, hi) = (def.min.min(def.max), def.max.max(def.min));
                        match def.kind {
                            FeatureKind::Int => {
                                rng.gen_range(lo.round() as i64..=hi.round() as i64) as f64
                            }
                            FeatureKind::Float => rng.gen_range(lo..=hi),
                        }
                    }
                    None => rng.gen_range(0.0..=1.0),
                })
                .collect();
            FeatureVector::new(order.to_vec(), values)
        })
        .collect()
}

/// The challenger side of a champion/challenger experiment.
struct Experiment {
    node: Arc<ServingNode>,
    monitor: Arc<OutputMonitor>,
    router: Arc<TrafficRouter>,
}

/// Drives the model lifecycle. The only component that changes stages.
pub struct DeploymentPipeline {
    registry: Arc<dyn ModelRegistry>,
    config: DeploymentConfig,
    features: FeatureSpec,
    prediction_timeout: Duration,
    audit: AuditTrail,
    critical: tokio::sync::Mutex<()>,
    serving_node: Option<Arc<ServingNode>>,
    monitor: Option<Arc<OutputMonitor>>,
    experiment: Option<Experiment>,
    drift: Option<Arc<DriftDetector>>,
    snapshots: Option<SnapshotStore>,
}

impl DeploymentPipeline {
    pub fn new(registry: Arc<dyn ModelRegistry>, config: &ServingConfig, audit: AuditTrail) -> Self {
        Self {
            registry,
            config: config.deployment.clone(),
            features: config.features.clone(),
            prediction_timeout: Duration::from_millis(config.model.prediction_timeout_ms.max(1)),
            audit,
            critical: tokio::sync::Mutex::new(()),
            serving_node: None,
            monitor: None,
            experiment: None,
            drift: None,
            snapshots: None,
        }
    }

    /// Node hot-reloaded after each promotion or rollback.
    pub fn with_serving_node(mut self, node: Arc<ServingNode>) -> Self {
        self.serving_node = Some(node);
        self
    }

    /// Monitor whose baseline is reset after each promotion or rollback.
    pub fn with_monitor(mut self, monitor: Arc<OutputMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Challenger node, its monitor and the router splitting traffic to it.
    /// The challenger monitor gets the champion baseline; promoting the
    /// version the challenger serves ends the experiment.
    pub fn with_challenger(
        mut self,
        node: Arc<ServingNode>,
        monitor: Arc<OutputMonitor>,
        router: Arc<TrafficRouter>,
    ) -> Self {
        self.experiment = Some(Experiment {
            node,
            monitor,
            router,
        });
        self
    }

    /// Detector whose references follow the serving version.
    pub fn with_drift(mut self, drift: Arc<DriftDetector>) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn history(&self, name: Option<&str>) -> Vec<DeploymentRecord> {
        self.audit.history(name)
    }

    async fn production_version(&self, name: &str) -> Result<Option<u32>> {
        let versions = self
            .registry
            .list_versions(name, Some(ModelStage::Production))
            .await?;
        Ok(versions.last().map(|v| v.version))
    }

    /// Run the validation battery against `name` v`version`, which must be
    /// in Staging. Never fails: problems show up as failed checks.
    pub async fn validate(
        &self,
        name: &str,
        version: u32,
        latency_sla_ms: Option<f64>,
    ) -> ValidationResult {
        let sla = latency_sla_ms.unwrap_or(self.config.latency_sla_ms);
        let mut checks = BTreeMap::new();
        let mut details = ValidationDetails::default();

        let node = match self.load_candidate(name, version).await {
            Ok(node) => node,
            Err(e) => {
                checks.insert(CHECK_MODEL_LOADS.to_string(), false);
                details.load_error = Some(e.to_string());
                warn!(name, version, error = %e, "Validation candidate failed to load");
                return ValidationResult {
                    passed: false,
                    checks,
                    details,
                    latency_sla_ms: sla,
                    timestamp: Utc::now(),
                };
            }
        };
        checks.insert(CHECK_MODEL_LOADS.to_string(), true);

        let order = node
            .current()
            .map(|m| m.feature_list.clone())
            .unwrap_or_default();
        let events = synthetic_events(
            &order,
            &self.features,
            self.config.validation_set_size,
            self.config.validation_seed,
        );

        let mut scores = Vec::with_capacity(events.len());
        let mut latencies = Vec::with_capacity(events.len());
        for event in &events {
            let start = Instant::now();
            match node.predict_raw(event).await {
                Ok((raw, _)) => scores.push(raw),
                Err(e) => {
                    details.prediction_error = Some(e.to_string());
                    scores.push(f64::NAN);
                }
            }
            latencies.push(start.elapsed().as_secs_f64() * 1000.0);
        }

        let finite: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        checks.insert(
            CHECK_SCORES_VALID.to_string(),
            finite.len() == scores.len(),
        );
        checks.insert(
            CHECK_SCORES_IN_RANGE.to_string(),
            finite.iter().all(|s| (0.0..=1.0).contains(s)),
        );

        let sorted_latency = stats::sorted(&latencies);
        let p95 = stats::percentile_sorted(&sorted_latency, 95.0);
        checks.insert(CHECK_LATENCY_WITHIN_SLA.to_string(), p95 <= sla);

        details.num_events_tested = events.len();
        details.valid_score_pct = if scores.is_empty() {
            1.0
        } else {
            finite.len() as f64 / scores.len() as f64
        };
        details.mean_score = stats::mean(&finite);
        details.latency_p50_ms = stats::percentile_sorted(&sorted_latency, 50.0);
        details.latency_p95_ms = p95;
        details.latency_p99_ms = stats::percentile_sorted(&sorted_latency, 99.0);

        let passed = checks.values().all(|ok| *ok);
        info!(name, version, passed, ?checks, "Model validation complete");
        ValidationResult {
            passed,
            checks,
            details,
            latency_sla_ms: sla,
            timestamp: Utc::now(),
        }
    }

    /// Load a Staging version into a node nothing else can see.
    async fn load_candidate(&self, name: &str, version: u32) -> Result<ServingNode> {
        let candidate = self.registry.get(name, version).await?;
        if candidate.stage != ModelStage::Staging {
            return Err(ServingError::model_load(format!(
                "{name} v{version} is in {}, not Staging",
                candidate.stage
            )));
        }
        let node = ServingNode::isolated(Arc::clone(&self.registry), name, self.prediction_timeout);
        let outcome = node.load_version(name, version).await;
        if !outcome.success {
            return Err(ServingError::model_load(
                outcome.error.unwrap_or_else(|| format!("{name} v{version} did not load")),
            ));
        }
        Ok(node)
    }

    /// Promote a Staging version to Production, archiving the incumbent.
    ///
    /// A failed validation aborts with `ValidationFailed` before any stage
    /// changes.
    pub async fn promote(
        &self,
        name: &str,
        version: u32,
        triggered_by: &str,
        skip_validation: bool,
    ) -> Result<DeploymentRecord> {
        let _guard = self.critical.lock().await;
        let mut record = NewRecord {
            model_name: name.to_string(),
            model_version: Some(version),
            previous_version: None,
            action: DeploymentAction::Promote,
            triggered_by: triggered_by.to_string(),
            validation: None,
            success: false,
            error: None,
        };

        record.previous_version = match self.production_version(name).await {
            Ok(v) => v,
            Err(e) => return self.fail(record, e),
        };

        if !skip_validation {
            let validation = self.validate(name, version, None).await;
            let failed = validation.failed_checks();
            record.validation = Some(validation);
            if !failed.is_empty() {
                warn!(name, version, ?failed, "Promotion blocked, validation failed");
                return self.fail(
                    record,
                    ServingError::ValidationFailed {
                        name: name.to_string(),
                        version,
                        failed_checks: failed,
                    },
                );
            }
        }

        if let Err(e) = self.swap_production(name, version, record.previous_version).await {
            return self.fail(record, e);
        }

        record.success = true;
        let committed = self.audit.record(record);
        info!(
            name,
            version,
            previous_version = ?committed.previous_version,
            "Model promoted to Production"
        );
        self.after_switch(name, version).await;
        Ok(committed)
    }

    /// Restore the highest-numbered Archived version, archiving the current
    /// Production version.
    pub async fn rollback(&self, name: &str, triggered_by: &str) -> Result<DeploymentRecord> {
        let _guard = self.critical.lock().await;
        let mut record = NewRecord {
            model_name: name.to_string(),
            model_version: None,
            previous_version: None,
            action: DeploymentAction::Rollback,
            triggered_by: triggered_by.to_string(),
            validation: None,
            success: false,
            error: None,
        };

        record.previous_version = match self.production_version(name).await {
            Ok(v) => v,
            Err(e) => return self.fail(record, e),
        };
        let archived = match self
            .registry
            .list_versions(name, Some(ModelStage::Archived))
            .await
        {
            Ok(v) => v,
            Err(e) => return self.fail(record, e),
        };
        let Some(target) = archived.iter().map(|v| v.version).max() else {
            error!(name, "Rollback failed, no archived version");
            return self.fail(record, ServingError::NoArchivedVersion(name.to_string()));
        };
        record.model_version = Some(target);

        if let Err(e) = self.swap_production(name, target, record.previous_version).await {
            return self.fail(record, e);
        }

        record.success = true;
        let committed = self.audit.record(record);
        info!(
            name,
            rolled_back_to = target,
            from_version = ?committed.previous_version,
            "Model rolled back"
        );
        self.after_switch(name, target).await;
        Ok(committed)
    }

    /// Move a Staging or Production version to Archived.
    pub async fn archive(
        &self,
        name: &str,
        version: u32,
        triggered_by: &str,
    ) -> Result<DeploymentRecord> {
        self.single_transition(name, version, ModelStage::Archived, DeploymentAction::Archive, triggered_by)
            .await
    }

    /// Move a freshly registered version into Staging.
    pub async fn stage_candidate(
        &self,
        name: &str,
        version: u32,
        triggered_by: &str,
    ) -> Result<DeploymentRecord> {
        self.single_transition(name, version, ModelStage::Staging, DeploymentAction::Stage, triggered_by)
            .await
    }

    async fn single_transition(
        &self,
        name: &str,
        version: u32,
        to: ModelStage,
        action: DeploymentAction,
        triggered_by: &str,
    ) -> Result<DeploymentRecord> {
        let _guard = self.critical.lock().await;
        let mut record = NewRecord {
            model_name: name.to_string(),
            model_version: Some(version),
            previous_version: None,
            action,
            triggered_by: triggered_by.to_string(),
            validation: None,
            success: false,
            error: None,
        };
        if let Err(e) = self.registry.transition_stage(name, version, to).await {
            return self.fail(record, e);
        }
        record.success = true;
        Ok(self.audit.record(record))
    }

    /// Archive `incumbent` (if any) and promote `target`. If the promote step
    /// fails the incumbent is restored, so callers never see a name with no
    /// Production version because of a half-applied swap.
    async fn swap_production(&self, name: &str, target: u32, incumbent: Option<u32>) -> Result<()> {
        let Some(prev) = incumbent.filter(|p| *p != target) else {
            self.registry
                .transition_stage(name, target, ModelStage::Production)
                .await?;
            return Ok(());
        };

        self.registry
            .transition_stage(name, prev, ModelStage::Archived)
            .await?;
        if let Err(e) = self
            .registry
            .transition_stage(name, target, ModelStage::Production)
            .await
        {
            if let Err(restore) = self
                .registry
                .transition_stage(name, prev, ModelStage::Production)
                .await
            {
                error!(name, version = prev, error = %restore, "Failed to restore incumbent");
            }
            return Err(e);
        }
        Ok(())
    }

    fn fail(&self, mut record: NewRecord, err: ServingError) -> Result<DeploymentRecord> {
        record.success = false;
        record.error = Some(err.to_string());
        self.audit.record(record);
        Err(err)
    }

    /// After a version starts serving: line up baselines and references,
    /// hot-reload the attached node and end any experiment on that version.
    /// Failures here are logged; the stage change has already been committed.
    async fn after_switch(&self, name: &str, version: u32) {
        self.restore_serving_state(name, version).await;

        if let Some(node) = &self.serving_node {
            let outcome = node.reload().await;
            if !outcome.success {
                warn!(name, version, error = ?outcome.error, "Hot reload after deployment failed");
            }
        }
        self.conclude_experiment(name, version);
    }

    /// Install the baseline and drift references stored for `name`
    /// v`version` into the attached monitors and detector. Whatever is
    /// missing is captured now and persisted for the next start.
    pub async fn restore_serving_state(&self, name: &str, version: u32) {
        let snapshot = match &self.snapshots {
            Some(store) => match store.load(name, version) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(name, version, error = %e, "Failed to read model snapshot");
                    None
                }
            },
            None => None,
        };

        let monitors: Vec<&Arc<OutputMonitor>> = self
            .monitor
            .iter()
            .chain(self.experiment.iter().map(|e| &e.monitor))
            .collect();
        if !monitors.is_empty() || self.snapshots.is_some() {
            let stored = snapshot.as_ref().and_then(|s| s.baseline.clone());
            let restored = stored.is_some();
            let baseline = match stored {
                Some(baseline) => Ok(baseline),
                None => self.capture_baseline(name, version).await,
            };
            match baseline {
                Ok(baseline) => {
                    for monitor in &monitors {
                        monitor.install_baseline(baseline.clone());
                    }
                    if !restored
                        && let Some(store) = &self.snapshots
                        && let Err(e) = store.save_baseline(name, version, &baseline)
                    {
                        warn!(name, version, error = %e, "Failed to persist baseline");
                    }
                }
                Err(e) => warn!(name, version, error = %e, "Baseline capture failed"),
            }
        }

        let Some(drift) = &self.drift else {
            return;
        };
        let stored = snapshot.map(|s| s.references).unwrap_or_default();
        if stored.is_empty() {
            // A new version inherits the references in use until now.
            if let Err(e) = self.persist_references(name, version) {
                warn!(name, version, error = %e, "Failed to persist drift references");
            }
        } else {
            info!(name, version, features = stored.len(), "Restoring drift references");
            for (feature, reference) in stored {
                drift.install_reference(&feature, reference);
            }
        }
    }

    /// Save the attached detector's references under `name` v`version`.
    /// Nothing is written when no detector, store or reference is present.
    pub fn persist_references(&self, name: &str, version: u32) -> Result<()> {
        let (Some(drift), Some(store)) = (&self.drift, &self.snapshots) else {
            return Ok(());
        };
        let references = drift.references();
        if references.is_empty() {
            return Ok(());
        }
        store.save_references(name, version, references)
    }

    /// End the experiment when the challenger serves `name` v`version`,
    /// which has just become the champion: unload the challenger, send all
    /// traffic back to the champion and drop the challenger's observations.
    pub fn conclude_experiment(&self, name: &str, version: u32) -> bool {
        let Some(experiment) = &self.experiment else {
            return false;
        };
        let serving = experiment
            .node
            .current()
            .is_some_and(|m| m.name == name && m.version == version);
        if !serving {
            return false;
        }
        experiment.node.unload();
        experiment.router.reset();
        experiment.monitor.clear_observations();
        info!(name, version, "Challenger promoted, experiment concluded");
        true
    }

    /// Score the synthetic set with `name` v`version` in an isolated node.
    async fn capture_baseline(&self, name: &str, version: u32) -> Result<Baseline> {
        let node = ServingNode::isolated(Arc::clone(&self.registry), name, self.prediction_timeout);
        let outcome = node.load_version(name, version).await;
        if !outcome.success {
            return Err(ServingError::model_load(
                outcome.error.unwrap_or_else(|| format!("{name} v{version} did not load")),
            ));
        }
        let order = node
            .current()
            .map(|m| m.feature_list.clone())
            .unwrap_or_default();
        let events = synthetic_events(
            &order,
            &self.features,
            self.config.validation_set_size,
            self.config.validation_seed,
        );
        let scores: Vec<f64> = node
            .predict_batch(&events)
            .await
            .into_iter()
            .filter_map(|r| r.ok().map(|p| p.score))
            .collect();
        Baseline::from_scores(&scores, Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConstantModel, ScoringModel};
    use crate::registry::{LocalRegistry, ModelArtifact, TrainingMetadata};

    fn two_features() -> Vec<String> {
        vec!["amount".into(), "hour_of_day".into()]
    }

    async fn staged(registry: &LocalRegistry, model: Arc<dyn ScoringModel>) -> u32 {
        let mv = registry
            .register_model("fraud", model, TrainingMetadata::new(two_features()))
            .unwrap();
        registry
            .transition_stage("fraud", mv.version, ModelStage::Staging)
            .await
            .unwrap();
        mv.version
    }

    fn pipeline(registry: Arc<LocalRegistry>) -> DeploymentPipeline {
        DeploymentPipeline::new(registry, &ServingConfig::default(), AuditTrail::in_memory())
    }

    #[test]
    fn test_synthetic_events_are_deterministic_and_in_range() {
        let spec = FeatureSpec::default();
        let order = spec.names();
        let a = synthetic_events(&order, &spec, 100, 42);
        let b = synthetic_events(&order, &spec, 100, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 100);
        for event in &a {
            assert!(event.matches_schema(&order));
            for def in &spec.features {
                let v = event.get(&def.name).unwrap();
                assert!(v >= def.min && v <= def.max, "{} = {v}", def.name);
                if def.kind == FeatureKind::Int {
                    assert_eq!(v.fract(), 0.0);
                }
            }
        }
        let unknown = synthetic_events(&["mystery".to_string()], &spec, 10, 1);
        assert!(unknown.iter().all(|e| (0.0..=1.0).contains(&e.values()[0])));
    }

    #[tokio::test]
    async fn test_validate_passes_good_model() {
        let registry = Arc::new(LocalRegistry::new());
        let v = staged(&registry, Arc::new(ConstantModel::new(0.3))).await;
        let result = pipeline(registry).validate("fraud", v, None).await;
        assert!(result.passed, "{:?}", result.checks);
        assert_eq!(result.checks.len(), 4);
        assert_eq!(result.details.num_events_tested, 100);
        assert_eq!(result.details.valid_score_pct, 1.0);
        assert!((result.details.mean_score - 0.3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_validate_flags_bad_scores() {
        let registry = Arc::new(LocalRegistry::new());
        let nan = staged(&registry, Arc::new(ConstantModel::new(f64::NAN))).await;
        let high = staged(&registry, Arc::new(ConstantModel::new(1.5))).await;
        let pipeline = pipeline(registry);

        let result = pipeline.validate("fraud", nan, None).await;
        assert!(!result.passed);
        assert_eq!(result.failed_checks(), vec![CHECK_SCORES_VALID.to_string()]);
        assert_eq!(result.details.valid_score_pct, 0.0);

        let result = pipeline.validate("fraud", high, None).await;
        assert_eq!(result.failed_checks(), vec![CHECK_SCORES_IN_RANGE.to_string()]);
    }

    #[tokio::test]
    async fn test_validate_requires_staging() {
        let registry = Arc::new(LocalRegistry::new());
        registry
            .register(
                "fraud",
                ModelArtifact::Constant { score: 0.2 },
                TrainingMetadata::new(two_features()),
            )
            .await
            .unwrap();
        let result = pipeline(registry).validate("fraud", 1, None).await;
        assert!(!result.passed);
        assert_eq!(result.checks.get(CHECK_MODEL_LOADS), Some(&false));
        assert!(result.details.load_error.unwrap().contains("not Staging"));
    }

    #[tokio::test]
    async fn test_validate_latency_sla() {
        let registry = Arc::new(LocalRegistry::new());
        let v = staged(&registry, Arc::new(ConstantModel::new(0.3))).await;
        let result = pipeline(registry).validate("fraud", v, Some(-1.0)).await;
        assert_eq!(
            result.failed_checks(),
            vec![CHECK_LATENCY_WITHIN_SLA.to_string()]
        );
        assert_eq!(result.latency_sla_ms, -1.0);
    }

    #[tokio::test]
    async fn test_promote_archives_incumbent() {
        let registry = Arc::new(LocalRegistry::new());
        let v1 = staged(&registry, Arc::new(ConstantModel::new(0.2))).await;
        let v2 = staged(&registry, Arc::new(ConstantModel::new(0.4))).await;
        let pipeline = pipeline(registry.clone());

        let first = pipeline.promote("fraud", v1, "ops", false).await.unwrap();
        assert_eq!(first.previous_version, None);
        let second = pipeline.promote("fraud", v2, "ops", false).await.unwrap();
        assert_eq!(second.previous_version, Some(v1));
        assert!(second.validation.as_ref().unwrap().passed);

        assert_eq!(registry.get("fraud", v1).await.unwrap().stage, ModelStage::Archived);
        assert_eq!(registry.get("fraud", v2).await.unwrap().stage, ModelStage::Production);
        assert_eq!(pipeline.history(Some("fraud")).len(), 2);
    }

    #[tokio::test]
    async fn test_illegal_promotion_is_recorded_and_restores_incumbent() {
        let registry = Arc::new(LocalRegistry::new());
        let v1 = staged(&registry, Arc::new(ConstantModel::new(0.2))).await;
        let pipeline = pipeline(registry.clone());
        pipeline.promote("fraud", v1, "ops", true).await.unwrap();

        // v2 never reaches Staging: None -> Production is illegal.
        registry
            .register_model(
                "fraud",
                Arc::new(ConstantModel::new(0.3)),
                TrainingMetadata::new(two_features()),
            )
            .unwrap();
        let err = pipeline.promote("fraud", 2, "ops", true).await.unwrap_err();
        assert!(matches!(err, ServingError::IllegalTransition { .. }));
        assert_eq!(registry.get("fraud", v1).await.unwrap().stage, ModelStage::Production);

        let history = pipeline.history(None);
        assert_eq!(history.len(), 2);
        assert!(!history[1].success);
        assert!(history[1].error.is_some());
    }

    #[tokio::test]
    async fn test_stage_and_archive_are_audited() {
        let registry = Arc::new(LocalRegistry::new());
        registry
            .register(
                "fraud",
                ModelArtifact::Constant { score: 0.2 },
                TrainingMetadata::new(two_features()),
            )
            .await
            .unwrap();
        let pipeline = pipeline(registry.clone());

        let staged = pipeline.stage_candidate("fraud", 1, "ops").await.unwrap();
        assert_eq!(staged.action, DeploymentAction::Stage);
        let archived = pipeline.archive("fraud", 1, "ops").await.unwrap();
        assert_eq!(archived.action, DeploymentAction::Archive);
        assert!(pipeline.archive("fraud", 1, "ops").await.is_err());

        let history = pipeline.history(Some("fraud"));
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, true, false]
        );
    }

    #[tokio::test]
    async fn test_promotion_sets_monitor_baseline_and_reloads_node() {
        let registry = Arc::new(LocalRegistry::new());
        let v1 = staged(&registry, Arc::new(ConstantModel::new(0.25))).await;
        let mut config = ServingConfig::default();
        config.model.name = "fraud".into();
        let node = Arc::new(ServingNode::new(registry.clone(), &config.model));
        let monitor = Arc::new(OutputMonitor::new(config.monitoring.clone()));
        let pipeline = DeploymentPipeline::new(registry, &config, AuditTrail::in_memory())
            .with_serving_node(node.clone())
            .with_monitor(monitor.clone());

        pipeline.promote("fraud", v1, "ops", false).await.unwrap();

        let baseline = monitor.baseline().unwrap();
        assert_eq!(baseline.model_version, Some(v1));
        assert!((baseline.mean - 0.25).abs() < 1e-12);
        let status = node.status();
        assert_eq!(status.version, Some(v1));
        assert_eq!(status.stage, Some(ModelStage::Production));
    }
}
