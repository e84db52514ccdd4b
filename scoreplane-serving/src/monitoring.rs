//! Output monitoring: score distribution shift and latency SLA checks over
//! sliding time windows.
//!
//! Score shift compares the 1h window mean against the deployment baseline:
//! `z = |mean − baseline_mean| / max(baseline_std, 0.001)`. Latency checks
//! compare the 1h p95/p99 against fixed SLA ceilings; a breach is always
//! critical.

use crate::alerts::{AlertRing, Severity};
use crate::config::MonitoringConfig;
use crate::error::{Result, ServingError};
use crate::stats::{self, Observation, RingBuffer, TimeWindow};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Critical z threshold as a multiple of the warning threshold.
pub const CRITICAL_SHIFT_MULTIPLIER: f64 = 1.5;

const MIN_BASELINE_STD: f64 = 0.001;

/// Window the alert checks run over.
pub const ALERT_WINDOW: TimeWindow = TimeWindow::OneHour;

/// Score statistics captured when a model version begins serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
    pub model_version: Option<u32>,
    pub captured_at: DateTime<Utc>,
}

impl Baseline {
    pub fn from_scores(scores: &[f64], model_version: Option<u32>) -> Result<Self> {
        let sorted = stats::sorted(scores);
        if sorted.is_empty() {
            return Err(ServingError::insufficient_data(
                "baseline needs at least one score",
            ));
        }
        Ok(Self {
            mean: stats::mean(&sorted),
            std: stats::std_dev(&sorted),
            p50: stats::percentile_sorted(&sorted, 50.0),
            p95: stats::percentile_sorted(&sorted, 95.0),
            p99: stats::percentile_sorted(&sorted, 99.0),
            count: sorted.len(),
            model_version,
            captured_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub mean: f64,
    pub std: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl ScoreDistribution {
    fn from_values(values: &[f64]) -> Self {
        let sorted = stats::sorted(values);
        if sorted.is_empty() {
            return Self::default();
        }
        Self {
            mean: stats::mean(&sorted),
            std: stats::std_dev(&sorted),
            p50: stats::percentile_sorted(&sorted, 50.0),
            p95: stats::percentile_sorted(&sorted, 95.0),
            p99: stats::percentile_sorted(&sorted, 99.0),
            count: sorted.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: usize,
}

impl LatencyStats {
    fn from_values(values: &[f64]) -> Self {
        let sorted = stats::sorted(values);
        Self {
            p50_ms: stats::percentile_sorted(&sorted, 50.0),
            p95_ms: stats::percentile_sorted(&sorted, 95.0),
            p99_ms: stats::percentile_sorted(&sorted, 99.0),
            count: sorted.len(),
        }
    }
}

/// Outcome of a score-shift evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    /// No baseline has been set for the serving version.
    NoBaseline,
    InsufficientData,
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreShift {
    pub status: ShiftStatus,
    pub z_shift: Option<f64>,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringAlertType {
    ScoreDistributionShift,
    LatencySlaBreach,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub alert_type: MonitoringAlertType,
    pub severity: Severity,
    /// `score_mean`, `latency_p95` or `latency_p99`.
    pub metric_name: String,
    pub current_value: f64,
    pub baseline_value: f64,
    pub threshold: f64,
    pub window: TimeWindow,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub model_version: Option<u32>,
    pub last_baseline_at: Option<DateTime<Utc>>,
    /// Predictions recorded since the monitor was created.
    pub total_predictions: u64,
    pub score_distribution_1h: ScoreDistribution,
    pub score_distribution_24h: ScoreDistribution,
    pub score_distribution_7d: ScoreDistribution,
    pub latency_1h: LatencyStats,
    pub score_shift: ScoreShift,
    pub baseline: Option<Baseline>,
    pub recent_alerts: Vec<MonitoringAlert>,
}

/// Tracks prediction scores and latencies for one serving variant.
///
/// Scores and latencies live in separate buffers with separate locks.
pub struct OutputMonitor {
    config: MonitoringConfig,
    scores: Mutex<RingBuffer<Observation>>,
    latencies: Mutex<RingBuffer<Observation>>,
    baseline: ArcSwapOption<Baseline>,
    alerts: AlertRing<MonitoringAlert>,
    recorded: AtomicU64,
}

impl OutputMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            scores: Mutex::new(RingBuffer::new(config.max_observations)),
            latencies: Mutex::new(RingBuffer::new(config.max_observations)),
            baseline: ArcSwapOption::empty(),
            alerts: AlertRing::new(config.alert_capacity),
            recorded: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Compute and store the baseline for a newly serving version.
    pub fn set_baseline(&self, scores: &[f64], model_version: Option<u32>) -> Result<Baseline> {
        let baseline = Baseline::from_scores(scores, model_version)?;
        self.install_baseline(baseline.clone());
        Ok(baseline)
    }

    /// Install a previously captured baseline (e.g. from a snapshot).
    pub fn install_baseline(&self, baseline: Baseline) {
        info!(
            model_version = ?baseline.model_version,
            mean = baseline.mean,
            std = baseline.std,
            count = baseline.count,
            "Monitoring baseline set"
        );
        self.baseline.store(Some(Arc::new(baseline)));
    }

    pub fn baseline(&self) -> Option<Baseline> {
        self.baseline.load_full().map(|b| (*b).clone())
    }

    /// Record one prediction; every `check_interval` records the alert checks
    /// run and any new alerts are returned.
    pub fn record_prediction(&self, score: f64, latency_ms: f64) -> Vec<MonitoringAlert> {
        self.record_at(score, latency_ms, Utc::now())
    }

    pub fn record_at(
        &self,
        score: f64,
        latency_ms: f64,
        timestamp: DateTime<Utc>,
    ) -> Vec<MonitoringAlert> {
        self.scores.lock().push(Observation::at(score, timestamp));
        self.latencies
            .lock()
            .push(Observation::at(latency_ms, timestamp));
        let n = self.recorded.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.config.check_interval.max(1) as u64 == 0 {
            self.check_alerts()
        } else {
            Vec::new()
        }
    }

    /// Drop windowed scores and latencies, e.g. when the variant starts
    /// serving a different model. Totals and past alerts are kept.
    pub fn clear_observations(&self) {
        self.scores.lock().clear();
        self.latencies.lock().clear();
    }

    pub fn total_predictions(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn score_distribution(&self, window: TimeWindow) -> ScoreDistribution {
        self.score_distribution_at(window, Utc::now())
    }

    fn score_distribution_at(&self, window: TimeWindow, now: DateTime<Utc>) -> ScoreDistribution {
        let values = self.scores.lock().values_since(window.cutoff(now));
        ScoreDistribution::from_values(&values)
    }

    pub fn latency_stats(&self, window: TimeWindow) -> LatencyStats {
        self.latency_stats_at(window, Utc::now())
    }

    fn latency_stats_at(&self, window: TimeWindow, now: DateTime<Utc>) -> LatencyStats {
        let values = self.latencies.lock().values_since(window.cutoff(now));
        LatencyStats::from_values(&values)
    }

    fn critical_shift_threshold(&self) -> f64 {
        self.config.score_shift_std_threshold * CRITICAL_SHIFT_MULTIPLIER
    }

    /// Evaluate score shift over `window` against the baseline.
    pub fn score_shift(&self, window: TimeWindow) -> ScoreShift {
        let current = self.score_distribution(window);
        self.shift_of(&current, window)
    }

    fn shift_of(&self, current: &ScoreDistribution, window: TimeWindow) -> ScoreShift {
        let Some(baseline) = self.baseline.load_full() else {
            return ScoreShift {
                status: ShiftStatus::NoBaseline,
                z_shift: None,
                window,
            };
        };
        if current.count < self.config.min_window_count {
            return ScoreShift {
                status: ShiftStatus::InsufficientData,
                z_shift: None,
                window,
            };
        }
        let z = (current.mean - baseline.mean).abs() / baseline.std.max(MIN_BASELINE_STD);
        let status = if z > self.critical_shift_threshold() {
            ShiftStatus::Critical
        } else if z > self.config.score_shift_std_threshold {
            ShiftStatus::Warning
        } else {
            ShiftStatus::Ok
        };
        ScoreShift {
            status,
            z_shift: Some(z),
            window,
        }
    }

    /// Run the score-shift and latency SLA checks over the alert window now.
    pub fn check_alerts(&self) -> Vec<MonitoringAlert> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        let current = self.score_distribution_at(ALERT_WINDOW, now);
        let shift = self.shift_of(&current, ALERT_WINDOW);
        let severity = match shift.status {
            ShiftStatus::Warning => Severity::Warning,
            ShiftStatus::Critical => Severity::Critical,
            _ => Severity::None,
        };
        if let (true, Some(z), Some(baseline)) =
            (severity.is_alert(), shift.z_shift, self.baseline.load_full())
        {
            warn!(
                z_shift = z,
                current_mean = current.mean,
                baseline_mean = baseline.mean,
                %severity,
                "Score distribution shift detected"
            );
            let mut details = serde_json::Map::new();
            details.insert("z_shift".into(), serde_json::json!(z));
            details.insert("window_count".into(), serde_json::json!(current.count));
            if let Some(version) = baseline.model_version {
                details.insert("baseline_version".into(), serde_json::json!(version));
            }
            alerts.push(MonitoringAlert {
                alert_type: MonitoringAlertType::ScoreDistributionShift,
                severity,
                metric_name: "score_mean".to_string(),
                current_value: current.mean,
                baseline_value: baseline.mean,
                threshold: self.config.score_shift_std_threshold,
                window: ALERT_WINDOW,
                timestamp: now,
                details,
            });
        }

        let latency = self.latency_stats_at(ALERT_WINDOW, now);
        if latency.count >= self.config.min_window_count {
            for (metric, value, sla) in [
                ("latency_p95", latency.p95_ms, self.config.latency_sla_p95_ms),
                ("latency_p99", latency.p99_ms, self.config.latency_sla_p99_ms),
            ] {
                if value <= sla {
                    continue;
                }
                warn!(metric, value_ms = value, sla_ms = sla, "Latency SLA breach");
                let mut details = serde_json::Map::new();
                details.insert("window_count".into(), serde_json::json!(latency.count));
                alerts.push(MonitoringAlert {
                    alert_type: MonitoringAlertType::LatencySlaBreach,
                    severity: Severity::Critical,
                    metric_name: metric.to_string(),
                    current_value: value,
                    baseline_value: sla,
                    threshold: sla,
                    window: ALERT_WINDOW,
                    timestamp: now,
                    details,
                });
            }
        }

        self.alerts.extend(alerts.iter().cloned());
        alerts
    }

    pub fn alerts(&self) -> Vec<MonitoringAlert> {
        self.alerts.all()
    }

    pub fn health_report(&self) -> HealthReport {
        let now = Utc::now();
        let baseline = self.baseline();
        let score_1h = self.score_distribution_at(TimeWindow::OneHour, now);
        HealthReport {
            model_version: baseline.as_ref().and_then(|b| b.model_version),
            last_baseline_at: baseline.as_ref().map(|b| b.captured_at),
            total_predictions: self.total_predictions(),
            score_shift: self.shift_of(&score_1h, TimeWindow::OneHour),
            score_distribution_1h: score_1h,
            score_distribution_24h: self.score_distribution_at(TimeWindow::OneDay, now),
            score_distribution_7d: self.score_distribution_at(TimeWindow::SevenDays, now),
            latency_1h: self.latency_stats_at(TimeWindow::OneHour, now),
            baseline,
            recent_alerts: self.alerts.recent(10),
        }
    }
}
