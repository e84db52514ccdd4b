//! Feature drift detection with the Population Stability Index.
//!
//! ```text
//! PSI = Σ (c_i − r_i) · ln(c_i / r_i)
//! ```
//!
//! `r_i` are reference bin proportions captured from training data, `c_i`
//! the proportions of the live buffer binned on the same edges. Both are
//! floored at [`PROPORTION_FLOOR`].
//!
//! | PSI | Status |
//! |---|---|
//! | < warning (0.10) | `ok` |
//! | < critical (0.25) | `moderate_drift` (warning alert) |
//! | ≥ critical | `critical_drift` (critical alert) |

use crate::alerts::{AlertRing, Severity};
use crate::config::DriftConfig;
use crate::error::{Result, ServingError};
use crate::model::FeatureVector;
use crate::stats::RingBuffer;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Minimum bin proportion, keeps `ln` and the division finite.
pub const PROPORTION_FLOOR: f64 = 1e-6;

/// Equal-width histogram of training values for one feature.
///
/// Immutable once built; replaced wholesale by `set_reference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    /// `num_bins + 1` ascending edges.
    pub edges: Vec<f64>,
    /// Floored bin proportions.
    pub proportions: Vec<f64>,
    pub sample_count: usize,
    pub captured_at: DateTime<Utc>,
}

impl ReferenceDistribution {
    /// Bin `values` (NaNs dropped) into `num_bins` equal-width bins.
    ///
    /// Fails with `InsufficientData` when fewer than `num_bins` finite
    /// values remain.
    pub fn from_values(values: &[f64], num_bins: usize) -> Result<Self> {
        let num_bins = num_bins.max(1);
        let clean: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if clean.len() < num_bins {
            return Err(ServingError::insufficient_data(format!(
                "{} reference values for {num_bins} bins",
                clean.len()
            )));
        }

        let (mut lo, mut hi) = clean
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / num_bins as f64;
        let mut edges: Vec<f64> = (0..num_bins).map(|i| lo + width * i as f64).collect();
        edges.push(hi);

        let proportions = proportions(&histogram(&edges, &clean));
        Ok(Self {
            edges,
            proportions,
            sample_count: clean.len(),
            captured_at: Utc::now(),
        })
    }

    pub fn num_bins(&self) -> usize {
        self.proportions.len()
    }

    /// Floored proportions of `values` binned on this reference's edges.
    pub fn bin(&self, values: &[f64]) -> Vec<f64> {
        proportions(&histogram(&self.edges, values))
    }

    /// PSI of `values` against this reference.
    pub fn psi(&self, values: &[f64]) -> f64 {
        psi(&self.bin(values), &self.proportions)
    }
}

/// Bin counts on `edges`. The last bin is closed on the right; values outside
/// the edges land in the nearest edge bin.
fn histogram(edges: &[f64], values: &[f64]) -> Vec<u64> {
    let bins = edges.len().saturating_sub(1).max(1);
    let mut counts = vec![0u64; bins];
    let (lo, hi) = (edges[0], edges[edges.len() - 1]);
    let width = (hi - lo) / bins as f64;
    for v in values.iter().copied().filter(|v| !v.is_nan()) {
        let idx = if width <= 0.0 || v <= lo {
            0
        } else if v >= hi {
            bins - 1
        } else {
            // Edge rounding can put a value one bin off; correct against
            // the stored edges.
            let mut i = (((v - lo) / width) as usize).min(bins - 1);
            while i > 0 && v < edges[i] {
                i -= 1;
            }
            while i + 1 < bins && v >= edges[i + 1] {
                i += 1;
            }
            i
        };
        counts[idx] += 1;
    }
    counts
}

fn proportions(counts: &[u64]) -> Vec<f64> {
    let total = counts.iter().sum::<u64>().max(1) as f64;
    counts
        .iter()
        .map(|c| (*c as f64 / total).max(PROPORTION_FLOOR))
        .collect()
}

/// PSI between two aligned, floored proportion vectors.
pub fn psi(current: &[f64], reference: &[f64]) -> f64 {
    current
        .iter()
        .zip(reference)
        .map(|(c, r)| (c - r) * (c / r).ln())
        .sum()
}

/// Drift status of one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Ok,
    ModerateDrift,
    CriticalDrift,
    InsufficientData,
    NoReference,
}

impl DriftStatus {
    pub fn severity(self) -> Severity {
        match self {
            Self::ModerateDrift => Severity::Warning,
            Self::CriticalDrift => Severity::Critical,
            _ => Severity::None,
        }
    }
}

/// Thresholds and sample size behind a drift alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlertDetails {
    pub psi_threshold_warning: f64,
    pub psi_threshold_critical: f64,
    pub observation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub feature_name: String,
    pub drift_score: f64,
    /// Always `"psi"`.
    pub drift_method: String,
    pub severity: Severity,
    /// e.g. `last_500_observations`.
    pub window: String,
    pub timestamp: DateTime<Utc>,
    pub details: DriftAlertDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDriftStatus {
    pub status: DriftStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psi: Option<f64>,
    pub observation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub features: BTreeMap<String, FeatureDriftStatus>,
    pub total_observations: u64,
    pub recent_alerts: Vec<DriftAlert>,
}

/// Per-feature state. Each feature has its own buffer lock so concurrent
/// requests recording different features never contend.
struct FeatureSlot {
    buffer: Mutex<RingBuffer<f64>>,
    reference: ArcSwapOption<ReferenceDistribution>,
    recorded: AtomicU64,
}

impl FeatureSlot {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(capacity)),
            reference: ArcSwapOption::empty(),
            recorded: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Vec<f64> {
        self.buffer.lock().iter().copied().collect()
    }
}

/// Tracks live feature distributions against training references.
pub struct DriftDetector {
    config: DriftConfig,
    slots: RwLock<BTreeMap<String, Arc<FeatureSlot>>>,
    alerts: AlertRing<DriftAlert>,
    total_observations: AtomicU64,
}

impl DriftDetector {
    pub fn new(feature_names: &[String], config: DriftConfig) -> Self {
        let slots = feature_names
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    Arc::new(FeatureSlot::new(config.max_observations)),
                )
            })
            .collect();
        Self {
            alerts: AlertRing::new(config.alert_capacity),
            config,
            slots: RwLock::new(slots),
            total_observations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    fn slot(&self, feature: &str) -> Arc<FeatureSlot> {
        if let Some(slot) = self.slots.read().get(feature) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(feature.to_string())
                .or_insert_with(|| Arc::new(FeatureSlot::new(self.config.max_observations))),
        )
    }

    /// Build and store the reference distribution for `feature`.
    pub fn set_reference(&self, feature: &str, training_values: &[f64]) -> Result<()> {
        let reference = match ReferenceDistribution::from_values(training_values, self.config.num_bins)
        {
            Ok(r) => r,
            Err(e) => {
                warn!(feature, count = training_values.len(), "Insufficient reference data");
                return Err(e);
            }
        };
        self.install_reference(feature, reference);
        Ok(())
    }

    /// Install a previously captured reference (e.g. from a snapshot).
    pub fn install_reference(&self, feature: &str, reference: ReferenceDistribution) {
        info!(
            feature,
            num_values = reference.sample_count,
            bins = reference.num_bins(),
            "Reference distribution set"
        );
        self.slot(feature).reference.store(Some(Arc::new(reference)));
    }

    /// Set references for every column of a training dataset. Columns with too
    /// few values are skipped; returns the number of references set.
    pub fn set_references(&self, dataset: &BTreeMap<String, Vec<f64>>) -> usize {
        dataset
            .iter()
            .filter(|(feature, values)| self.set_reference(feature, values).is_ok())
            .count()
    }

    /// Columnize training vectors and set a reference per feature.
    pub fn set_references_from_vectors(&self, rows: &[FeatureVector]) -> usize {
        let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in rows {
            for (name, value) in row.iter() {
                columns.entry(name.to_string()).or_default().push(value);
            }
        }
        self.set_references(&columns)
    }

    pub fn clear_reference(&self, feature: &str) {
        self.slot(feature).reference.store(None);
    }

    pub fn references(&self) -> BTreeMap<String, ReferenceDistribution> {
        self.slots
            .read()
            .iter()
            .filter_map(|(name, slot)| {
                slot.reference
                    .load_full()
                    .map(|r| (name.clone(), (*r).clone()))
            })
            .collect()
    }

    /// Append one value; every `check_interval` values of this feature the
    /// feature's PSI is recomputed and an alert returned if it drifted.
    pub fn record_observation(&self, feature: &str, value: f64) -> Option<DriftAlert> {
        if value.is_nan() {
            return None;
        }
        let slot = self.slot(feature);
        slot.buffer.lock().push(value);
        let n = slot.recorded.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_observations.fetch_add(1, Ordering::Relaxed);

        let interval = self.config.check_interval.max(1) as u64;
        if n % interval != 0 {
            return None;
        }
        let alert = self.evaluate(feature, &slot).1?;
        self.alerts.push(alert.clone());
        Some(alert)
    }

    /// Record every feature of a request.
    pub fn record_vector(&self, features: &FeatureVector) -> Vec<DriftAlert> {
        features
            .iter()
            .filter_map(|(name, value)| self.record_observation(name, value))
            .collect()
    }

    /// Check every feature now, regardless of the interval.
    pub fn check_drift(&self) -> Vec<DriftAlert> {
        let slots: Vec<(String, Arc<FeatureSlot>)> = self
            .slots
            .read()
            .iter()
            .map(|(n, s)| (n.clone(), Arc::clone(s)))
            .collect();
        let alerts: Vec<DriftAlert> = slots
            .iter()
            .filter_map(|(name, slot)| self.evaluate(name, slot).1)
            .collect();
        self.alerts.extend(alerts.iter().cloned());
        alerts
    }

    pub fn feature_status(&self, feature: &str) -> FeatureDriftStatus {
        let slot = self.slots.read().get(feature).cloned();
        match slot {
            Some(slot) => self.evaluate(feature, &slot).0,
            None => FeatureDriftStatus {
                status: if self.config.min_observations > 0 {
                    DriftStatus::InsufficientData
                } else {
                    DriftStatus::NoReference
                },
                psi: None,
                observation_count: 0,
            },
        }
    }

    fn classify(&self, psi: f64) -> DriftStatus {
        if psi >= self.config.psi_critical_threshold {
            DriftStatus::CriticalDrift
        } else if psi >= self.config.psi_warning_threshold {
            DriftStatus::ModerateDrift
        } else {
            DriftStatus::Ok
        }
    }

    fn evaluate(&self, feature: &str, slot: &FeatureSlot) -> (FeatureDriftStatus, Option<DriftAlert>) {
        let values = slot.snapshot();
        let count = values.len();
        if count < self.config.min_observations {
            return (
                FeatureDriftStatus {
                    status: DriftStatus::InsufficientData,
                    psi: None,
                    observation_count: count,
                },
                None,
            );
        }
        let Some(reference) = slot.reference.load_full() else {
            return (
                FeatureDriftStatus {
                    status: DriftStatus::NoReference,
                    psi: None,
                    observation_count: count,
                },
                None,
            );
        };

        let psi = reference.psi(&values);
        let status = self.classify(psi);
        debug!(feature, psi, ?status, count, "Drift check");
        let result = FeatureDriftStatus {
            status,
            psi: Some(round4(psi)),
            observation_count: count,
        };

        let severity = status.severity();
        if !severity.is_alert() {
            return (result, None);
        }
        warn!(feature, psi, %severity, "Feature drift detected");
        let alert = DriftAlert {
            feature_name: feature.to_string(),
            drift_score: round4(psi),
            drift_method: "psi".to_string(),
            severity,
            window: format!("last_{count}_observations"),
            timestamp: Utc::now(),
            details: DriftAlertDetails {
                psi_threshold_warning: self.config.psi_warning_threshold,
                psi_threshold_critical: self.config.psi_critical_threshold,
                observation_count: count,
            },
        };
        (result, Some(alert))
    }

    pub fn alerts(&self) -> Vec<DriftAlert> {
        self.alerts.all()
    }

    pub fn total_observations(&self) -> u64 {
        self.total_observations.load(Ordering::Relaxed)
    }

    pub fn drift_report(&self) -> DriftReport {
        let slots: Vec<(String, Arc<FeatureSlot>)> = self
            .slots
            .read()
            .iter()
            .map(|(n, s)| (n.clone(), Arc::clone(s)))
            .collect();
        let features = slots
            .iter()
            .map(|(name, slot)| (name.clone(), self.evaluate(name, slot).0))
            .collect();
        DriftReport {
            features,
            total_observations: self.total_observations(),
            recent_alerts: self.alerts.recent(10),
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
