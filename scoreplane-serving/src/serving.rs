//! Serving node: holds one loaded model, answers predictions and hot-reloads.
//!
//! The live model is an immutable [`LoadedModel`] snapshot behind an
//! `ArcSwapOption`. A prediction takes one snapshot up front and uses it for
//! schema checks, invocation and result tagging, so a concurrent reload can
//! never produce a result that mixes two versions. Reloads replace the whole
//! snapshot; fields of a live snapshot are never mutated.

use crate::config::ModelConfig;
use crate::error::{Result, ServingError};
use crate::model::{FeatureVector, ScoringModel};
use crate::registry::{ModelRegistry, ModelStage, ModelVersion};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Immutable handle to a model that is ready to serve.
pub struct LoadedModel {
    pub name: String,
    pub version: u32,
    pub stage: ModelStage,
    /// Ordered features the model was trained on.
    pub feature_list: Vec<String>,
    pub loaded_at: DateTime<Utc>,
    model: Arc<dyn ScoringModel>,
}

impl LoadedModel {
    pub fn new(version: &ModelVersion, model: Arc<dyn ScoringModel>) -> Self {
        Self {
            name: version.name.clone(),
            version: version.version,
            stage: version.stage,
            feature_list: version.metadata.feature_list.clone(),
            loaded_at: Utc::now(),
            model,
        }
    }

    /// Call the underlying predict function without any post-processing.
    pub fn invoke(&self, values: &[f64]) -> f64 {
        self.model.predict(values)
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("stage", &self.stage)
            .field("kind", &self.model.kind())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Standardized prediction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Clamped into [0, 1].
    pub score: f64,
    pub model_name: String,
    pub model_version: u32,
    pub latency_ms: f64,
}

/// Outcome of a load or reload. Failures are reported here, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub success: bool,
    pub model_name: String,
    /// Version serving after the attempt (the previous one on failure).
    pub model_version: Option<u32>,
    pub error: Option<String>,
}

/// Point-in-time view of a node for monitoring reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub version: Option<u32>,
    pub stage: Option<ModelStage>,
    pub loaded: bool,
    pub load_error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct LoadTarget {
    name: String,
    stage: ModelStage,
}

/// Serves predictions from one model at a time.
pub struct ServingNode {
    registry: Arc<dyn ModelRegistry>,
    current: ArcSwapOption<LoadedModel>,
    target: RwLock<LoadTarget>,
    fallback_stage: Option<ModelStage>,
    timeout: Duration,
    load_error: RwLock<Option<String>>,
    /// Serializes loads so two reloads cannot race each other's swap.
    load_lock: tokio::sync::Mutex<()>,
}

impl ServingNode {
    pub fn new(registry: Arc<dyn ModelRegistry>, config: &ModelConfig) -> Self {
        Self {
            registry,
            current: ArcSwapOption::empty(),
            target: RwLock::new(LoadTarget {
                name: config.name.clone(),
                stage: config.stage,
            }),
            fallback_stage: config.fallback_stage,
            timeout: Duration::from_millis(config.prediction_timeout_ms.max(1)),
            load_error: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Node with no fallback stage and an explicit timeout.
    pub fn isolated(registry: Arc<dyn ModelRegistry>, name: &str, timeout: Duration) -> Self {
        let config = ModelConfig {
            name: name.to_string(),
            stage: ModelStage::Staging,
            fallback_stage: None,
            prediction_timeout_ms: u64::try_from(timeout.as_millis().max(1)).unwrap_or(u64::MAX),
            ..ModelConfig::default()
        };
        Self::new(registry, &config)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch the `stage` version of `name` (falling back to the configured
    /// fallback stage) and atomically swap it in.
    ///
    /// On failure the previous model keeps serving and `load_error` is
    /// recorded; nothing is raised to the caller.
    pub async fn load(&self, name: &str, stage: ModelStage) -> ReloadOutcome {
        let _guard = self.load_lock.lock().await;
        *self.target.write() = LoadTarget {
            name: name.to_string(),
            stage,
        };

        let fetched = match self.fetch(name, stage).await {
            Ok(loaded) => Ok(loaded),
            Err(primary) => match self.fallback_stage.filter(|s| *s != stage) {
                Some(fallback) => {
                    warn!(
                        name,
                        %stage,
                        %fallback,
                        error = %primary,
                        "Primary stage load failed, trying fallback stage"
                    );
                    self.fetch(name, fallback).await
                }
                None => Err(primary),
            },
        };

        self.install(name, fetched)
    }

    /// Load one specific version regardless of the configured stage.
    pub async fn load_version(&self, name: &str, version: u32) -> ReloadOutcome {
        let _guard = self.load_lock.lock().await;
        let fetched = match self.registry.get(name, version).await {
            Ok(mv) => self
                .registry
                .fetch_model(&mv)
                .await
                .map(|model| LoadedModel::new(&mv, model)),
            Err(e) => Err(e),
        };
        self.install(name, fetched)
    }

    /// Re-run `load` with the last-used (name, stage).
    ///
    /// Safe while predictions are in flight: they keep the snapshot they
    /// started with.
    pub async fn reload(&self) -> ReloadOutcome {
        let target = self.target.read().clone();
        info!(name = %target.name, stage = %target.stage, "Model reload triggered");
        self.load(&target.name, target.stage).await
    }

    async fn fetch(&self, name: &str, stage: ModelStage) -> Result<LoadedModel> {
        let version = self.registry.load(name, stage).await?;
        let model = self.registry.fetch_model(&version).await?;
        Ok(LoadedModel::new(&version, model))
    }

    fn install(&self, name: &str, fetched: Result<LoadedModel>) -> ReloadOutcome {
        match fetched {
            Ok(loaded) => {
                let version = loaded.version;
                info!(
                    name = %loaded.name,
                    version,
                    stage = %loaded.stage,
                    "Model loaded for serving"
                );
                self.current.store(Some(Arc::new(loaded)));
                *self.load_error.write() = None;
                ReloadOutcome {
                    success: true,
                    model_name: name.to_string(),
                    model_version: Some(version),
                    error: None,
                }
            }
            Err(e) => {
                let message = ServingError::model_load(e.to_string()).to_string();
                let previous = self.current.load().as_ref().map(|m| m.version);
                warn!(
                    name,
                    error = %message,
                    serving_version = ?previous,
                    "Model load failed, previous model keeps serving"
                );
                *self.load_error.write() = Some(message.clone());
                ReloadOutcome {
                    success: false,
                    model_name: name.to_string(),
                    model_version: previous,
                    error: Some(message),
                }
            }
        }
    }

    /// Stop serving. In-flight predictions finish on the snapshot they hold;
    /// a later `load` or `reload` can bring a model back.
    pub fn unload(&self) -> Option<u32> {
        let previous = self.current.swap(None).map(|m| m.version);
        if let Some(version) = previous {
            let target = self.target.read();
            info!(name = %target.name, version, "Model unloaded");
        }
        previous
    }

    /// Current snapshot, if any model is loaded.
    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.current.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn load_error(&self) -> Option<String> {
        self.load_error.read().clone()
    }

    pub fn status(&self) -> NodeStatus {
        let snapshot = self.current();
        NodeStatus {
            name: self.target.read().name.clone(),
            version: snapshot.as_ref().map(|m| m.version),
            stage: snapshot.as_ref().map(|m| m.stage),
            loaded: snapshot.is_some(),
            load_error: self.load_error(),
            loaded_at: snapshot.as_ref().map(|m| m.loaded_at),
        }
    }

    /// Score one feature vector.
    ///
    /// Rejects vectors that don't match the model's trained feature list,
    /// clamps the output into [0, 1], and turns timeouts and non-finite
    /// output into `ServingError::Prediction`.
    pub async fn predict(&self, features: &FeatureVector) -> Result<PredictionResult> {
        let snapshot = self
            .current()
            .ok_or_else(|| ServingError::prediction("no model loaded"))?;
        let (raw, latency_ms) = self.invoke(&snapshot, features).await?;

        if !raw.is_finite() {
            error!(
                name = %snapshot.name,
                version = snapshot.version,
                raw = %raw,
                "Model produced non-finite output"
            );
            return Err(ServingError::prediction(format!(
                "{} v{} produced non-finite output {raw}",
                snapshot.name, snapshot.version
            )));
        }

        Ok(PredictionResult {
            score: raw.clamp(0.0, 1.0),
            model_name: snapshot.name.clone(),
            model_version: snapshot.version,
            latency_ms,
        })
    }

    /// Score a batch concurrently; results are aligned with the input.
    pub async fn predict_batch(&self, batch: &[FeatureVector]) -> Vec<Result<PredictionResult>> {
        join_all(batch.iter().map(|features| self.predict(features))).await
    }

    /// Unclamped model output and latency, for validation harnesses that
    /// need to see NaN/Inf and out-of-range values.
    pub async fn predict_raw(&self, features: &FeatureVector) -> Result<(f64, f64)> {
        let snapshot = self
            .current()
            .ok_or_else(|| ServingError::prediction("no model loaded"))?;
        self.invoke(&snapshot, features).await
    }

    async fn invoke(
        &self,
        snapshot: &Arc<LoadedModel>,
        features: &FeatureVector,
    ) -> Result<(f64, f64)> {
        if !features.matches_schema(&snapshot.feature_list) {
            return Err(ServingError::FeatureSchemaMismatch {
                expected: snapshot.feature_list.clone(),
                actual: features.names().to_vec(),
            });
        }

        let start = Instant::now();
        let model = Arc::clone(snapshot);
        let values = features.values().to_vec();
        let call = tokio::task::spawn_blocking(move || model.invoke(&values));

        let raw = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(join)) => {
                return Err(ServingError::prediction(format!(
                    "model invocation failed: {join}"
                )));
            }
            Err(_) => {
                warn!(
                    name = %snapshot.name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Prediction timed out"
                );
                return Err(ServingError::prediction(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(version = snapshot.version, latency_ms, "Prediction served");
        Ok((raw, latency_ms))
    }

    /// Re-run [`reload`](Self::reload) every `interval` until `cancel` fires.
    pub fn spawn_reload_loop(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the initial load is the
            // caller's job.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reload loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = self.reload().await;
                        if !outcome.success {
                            warn!(error = ?outcome.error, "Periodic reload failed");
                        }
                    }
                }
            }
        })
    }
}
