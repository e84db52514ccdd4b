//! Deterministic champion/challenger traffic split.
//!
//! Assignment is a pure function of (entity id, config): the SHA-256 digest
//! of the id, read as a big-endian integer, modulo 100. The same entity
//! therefore sees the same variant across calls and process restarts as long
//! as the split is unchanged.

use crate::config::{AutoPromotionConfig, RoutingSettings};
use crate::error::{Result, ServingError};
use crate::model::FeatureVector;
use crate::serving::{PredictionResult, ServingNode};
use crate::stats::{self, RingBuffer};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const PCT_TOLERANCE: f64 = 1e-6;

/// Traffic split between champion and challenger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub champion_pct: f64,
    pub challenger_pct: f64,
    /// When false every request goes to the champion.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            champion_pct: 100.0,
            challenger_pct: 0.0,
            enabled: true,
        }
    }
}

impl RoutingConfig {
    pub fn split(champion_pct: f64, challenger_pct: f64) -> Self {
        Self {
            champion_pct,
            challenger_pct,
            enabled: true,
        }
    }

    /// Each percentage must be in [0, 100] and the two must sum to 100.
    pub fn validate(&self) -> Result<()> {
        for (label, pct) in [
            ("champion_pct", self.champion_pct),
            ("challenger_pct", self.challenger_pct),
        ] {
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(ServingError::invalid_routing(format!(
                    "{label} must be in [0, 100], got {pct}"
                )));
            }
        }
        let total = self.champion_pct + self.challenger_pct;
        if (total - 100.0).abs() > PCT_TOLERANCE {
            return Err(ServingError::invalid_routing(format!(
                "traffic split must sum to 100, got {total}"
            )));
        }
        Ok(())
    }
}

impl From<&RoutingSettings> for RoutingConfig {
    fn from(settings: &RoutingSettings) -> Self {
        Self::split(settings.champion_pct, settings.challenger_pct)
    }
}

/// Which model served (or would serve) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Champion,
    Challenger,
    /// No model was available.
    None,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Champion => "champion",
            Self::Challenger => "challenger",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of which model handled a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub entity_id: String,
    pub variant: Variant,
    /// `None` when no model is loaded.
    pub prediction: Option<PredictionResult>,
    pub timestamp: DateTime<Utc>,
}

/// Summary statistics for one variant's observation window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub count: usize,
    pub mean_score: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub champion: VariantSummary,
    pub challenger: VariantSummary,
    /// Observations currently held across both windows.
    pub total_observations: usize,
    /// Every routed prediction since start or the last reset.
    pub total_routed: u64,
}

#[derive(Debug, Clone, Copy)]
struct RoutedSample {
    score: f64,
    latency_ms: f64,
}

/// Bounded (score, latency) window for one variant.
struct VariantMetrics {
    window: Mutex<RingBuffer<RoutedSample>>,
}

impl VariantMetrics {
    fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    fn record(&self, score: f64, latency_ms: f64) {
        self.window.lock().push(RoutedSample { score, latency_ms });
    }

    fn count(&self) -> usize {
        self.window.lock().len()
    }

    fn summary(&self) -> VariantSummary {
        let (scores, latencies): (Vec<f64>, Vec<f64>) = self
            .window
            .lock()
            .iter()
            .map(|s| (s.score, s.latency_ms))
            .unzip();
        VariantSummary {
            count: scores.len(),
            mean_score: stats::mean(&scores),
            mean_latency_ms: stats::mean(&latencies),
            p95_latency_ms: stats::percentile(&latencies, 95.0),
        }
    }

    fn clear(&self) {
        self.window.lock().clear();
    }
}

/// Hash `entity_id` to a bucket in [0, 100).
pub fn bucket(entity_id: &str) -> u8 {
    let digest = Sha256::digest(entity_id.as_bytes());
    // Big-endian digest mod 100, folded byte by byte.
    let rem = digest
        .iter()
        .fold(0u32, |acc, b| (acc * 256 + u32::from(*b)) % 100);
    rem as u8
}

/// Pure variant assignment for `entity_id` under `config`.
pub fn assign_variant(entity_id: &str, config: &RoutingConfig) -> Variant {
    if !config.enabled || config.challenger_pct <= 0.0 {
        return Variant::Champion;
    }
    if f64::from(bucket(entity_id)) < config.challenger_pct {
        Variant::Challenger
    } else {
        Variant::Champion
    }
}

/// Routes requests between a champion and a challenger serving node.
///
/// The config is read lock-free on every request; each variant's metrics
/// window has its own lock.
pub struct TrafficRouter {
    champion: ArcSwapOption<ServingNode>,
    challenger: ArcSwapOption<ServingNode>,
    config: ArcSwap<RoutingConfig>,
    champion_metrics: VariantMetrics,
    challenger_metrics: VariantMetrics,
    total_routed: AtomicU64,
    auto_promotion: AutoPromotionConfig,
}

impl TrafficRouter {
    pub fn new(settings: &RoutingSettings) -> Result<Self> {
        let config = RoutingConfig::from(settings);
        config.validate()?;
        Ok(Self {
            champion: ArcSwapOption::empty(),
            challenger: ArcSwapOption::empty(),
            config: ArcSwap::from_pointee(config),
            champion_metrics: VariantMetrics::new(settings.metrics_capacity),
            challenger_metrics: VariantMetrics::new(settings.metrics_capacity),
            total_routed: AtomicU64::new(0),
            auto_promotion: settings.auto_promotion.clone(),
        })
    }

    pub fn with_nodes(
        settings: &RoutingSettings,
        champion: Option<Arc<ServingNode>>,
        challenger: Option<Arc<ServingNode>>,
    ) -> Result<Self> {
        let router = Self::new(settings)?;
        router.champion.store(champion);
        router.challenger.store(challenger);
        Ok(router)
    }

    pub fn set_champion(&self, node: Option<Arc<ServingNode>>) {
        self.champion.store(node);
    }

    pub fn set_challenger(&self, node: Option<Arc<ServingNode>>) {
        self.challenger.store(node);
    }

    pub fn champion(&self) -> Option<Arc<ServingNode>> {
        self.champion.load_full()
    }

    pub fn challenger(&self) -> Option<Arc<ServingNode>> {
        self.challenger.load_full()
    }

    pub fn config(&self) -> RoutingConfig {
        **self.config.load()
    }

    /// Replace the split. On error the previous config stays in effect.
    pub fn update_config(&self, new_config: RoutingConfig) -> Result<RoutingConfig> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        info!(
            champion_pct = new_config.champion_pct,
            challenger_pct = new_config.challenger_pct,
            enabled = new_config.enabled,
            "Routing config updated"
        );
        Ok(new_config)
    }

    /// Conclude an experiment: back to 100/0 and empty metrics windows.
    pub fn reset(&self) {
        self.config.store(Arc::new(RoutingConfig::default()));
        self.champion_metrics.clear();
        self.challenger_metrics.clear();
        self.total_routed.store(0, Ordering::Relaxed);
        info!("Routing reset to champion only");
    }

    pub fn assign(&self, entity_id: &str) -> Variant {
        assign_variant(entity_id, &self.config.load())
    }

    /// Pick the node for `entity_id`, falling back to the champion when the
    /// assigned challenger is not loaded.
    pub fn select(&self, entity_id: &str) -> (Variant, Option<Arc<ServingNode>>) {
        let assigned = self.assign(entity_id);
        if assigned == Variant::Challenger
            && let Some(node) = self.challenger.load_full().filter(|n| n.is_loaded())
        {
            return (Variant::Challenger, Some(node));
        }
        match self.champion.load_full().filter(|n| n.is_loaded()) {
            Some(node) => (Variant::Champion, Some(node)),
            None => (Variant::None, None),
        }
    }

    /// Route one request and record its (score, latency) for the variant
    /// that served it.
    pub async fn route(&self, entity_id: &str, features: &FeatureVector) -> Result<RoutingDecision> {
        let (variant, node) = self.select(entity_id);
        let Some(node) = node else {
            debug!(entity_id, "No model available for routing");
            return Ok(RoutingDecision {
                entity_id: entity_id.to_string(),
                variant: Variant::None,
                prediction: None,
                timestamp: Utc::now(),
            });
        };

        let prediction = node.predict(features).await?;
        self.record(variant, prediction.score, prediction.latency_ms);
        Ok(RoutingDecision {
            entity_id: entity_id.to_string(),
            variant,
            prediction: Some(prediction),
            timestamp: Utc::now(),
        })
    }

    pub fn record(&self, variant: Variant, score: f64, latency_ms: f64) {
        match variant {
            Variant::Champion => self.champion_metrics.record(score, latency_ms),
            Variant::Challenger => self.challenger_metrics.record(score, latency_ms),
            Variant::None => return,
        }
        self.total_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        let champion = self.champion_metrics.summary();
        let challenger = self.challenger_metrics.summary();
        MetricsSummary {
            total_observations: champion.count + challenger.count,
            champion,
            challenger,
            total_routed: self.total_routed.load(Ordering::Relaxed),
        }
    }

    /// Whether the challenger should be promoted automatically.
    ///
    /// Returns `Ok(false)` while disabled or while either variant has fewer
    /// than `min_observations` samples. Past that point a significance test
    /// would be needed, which does not exist, so the call reports
    /// `ServingError::Unsupported` instead of guessing.
    pub fn check_auto_promotion(&self) -> Result<bool> {
        if !self.auto_promotion.enabled {
            return Ok(false);
        }
        let champion = self.champion_metrics.count();
        let challenger = self.challenger_metrics.count();
        if champion < self.auto_promotion.min_observations
            || challenger < self.auto_promotion.min_observations
        {
            return Ok(false);
        }
        info!(
            champion_count = champion,
            challenger_count = challenger,
            metric = %self.auto_promotion.metric,
            "Auto-promotion check reached significance stage"
        );
        Err(ServingError::Unsupported(format!(
            "significance test on '{}' for auto-promotion",
            self.auto_promotion.metric
        )))
    }
}
