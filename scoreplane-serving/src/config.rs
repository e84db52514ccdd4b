//! Configuration for the serving control plane.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.

use crate::hybrid::HybridStrategy;
use crate::registry::ModelStage;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level serving configuration aggregating all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Identity and loading of the served model.
    #[serde(default)]
    pub model: ModelConfig,
    /// Expected input features, in model order.
    #[serde(default)]
    pub features: FeatureSpec,
    /// Risk-tier cut points.
    #[serde(default)]
    pub thresholds: ScoringThresholds,
    /// Rule + model score blending.
    #[serde(default)]
    pub hybrid: HybridScoringConfig,
    /// Champion/challenger traffic split.
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Feature drift detection.
    #[serde(default)]
    pub drift: DriftConfig,
    /// Output score and latency monitoring.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Validation and promotion.
    #[serde(default)]
    pub deployment: DeploymentConfig,
    /// On-disk state.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Identity and loading configuration for the served model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_stage")]
    pub stage: ModelStage,
    /// Stage tried when loading from `stage` fails. `None` disables fallback.
    #[serde(default = "default_fallback_stage")]
    pub fallback_stage: Option<ModelStage>,
    /// Interval of the background reload loop.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Upper bound on a single model invocation.
    #[serde(default = "default_prediction_timeout")]
    pub prediction_timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            stage: default_stage(),
            fallback_stage: default_fallback_stage(),
            reload_interval_secs: default_reload_interval(),
            prediction_timeout_ms: default_prediction_timeout(),
        }
    }
}

fn default_model_name() -> String {
    "fraud-detector".to_string()
}

fn default_stage() -> ModelStage {
    ModelStage::Production
}

fn default_fallback_stage() -> Option<ModelStage> {
    Some(ModelStage::Staging)
}

fn default_reload_interval() -> u64 {
    300
}

fn default_prediction_timeout() -> u64 {
    1_000
}

/// Numeric kind of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Float,
    Int,
}

/// One expected input feature and its realistic range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDef {
    pub name: String,
    pub kind: FeatureKind,
    pub min: f64,
    pub max: f64,
}

impl FeatureDef {
    pub fn float(name: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Float,
            min,
            max,
        }
    }

    pub fn int(name: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Int,
            min,
            max,
        }
    }
}

/// Expected input features for the model, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    #[serde(default = "default_features")]
    pub features: Vec<FeatureDef>,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            features: default_features(),
        }
    }
}

impl FeatureSpec {
    pub fn names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&FeatureDef> {
        self.features.iter().find(|f| f.name == name)
    }
}

fn default_features() -> Vec<FeatureDef> {
    vec![
        FeatureDef::float("amount", 1.0, 5_000.0),
        FeatureDef::float("amount_zscore", -3.0, 3.0),
        FeatureDef::int("hour_of_day", 0.0, 23.0),
        FeatureDef::int("day_of_week", 0.0, 6.0),
        FeatureDef::int("tx_type_encoded", 0.0, 4.0),
        FeatureDef::float("balance_delta_sender", -50.0, 250.0),
        FeatureDef::float("balance_delta_receiver", -50.0, 250.0),
        FeatureDef::int("velocity_count_1h", 0.0, 9.0),
        FeatureDef::int("velocity_count_24h", 0.0, 29.0),
        FeatureDef::float("velocity_amount_1h", 0.0, 500.0),
        FeatureDef::float("velocity_amount_24h", 0.0, 2_500.0),
    ]
}

/// Score cut points for risk tiers. Above `high_max` is critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringThresholds {
    #[serde(default = "default_low_max")]
    pub low_max: f64,
    #[serde(default = "default_medium_max")]
    pub medium_max: f64,
    #[serde(default = "default_high_max")]
    pub high_max: f64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            low_max: default_low_max(),
            medium_max: default_medium_max(),
            high_max: default_high_max(),
        }
    }
}

fn default_low_max() -> f64 {
    0.3
}

fn default_medium_max() -> f64 {
    0.6
}

fn default_high_max() -> f64 {
    0.8
}

/// Configuration for combining rule-based and model scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridScoringConfig {
    #[serde(default)]
    pub strategy: HybridStrategy,
    #[serde(default = "default_rule_weight")]
    pub rule_weight: f64,
    #[serde(default = "default_ml_weight")]
    pub ml_weight: f64,
    #[serde(default = "default_true")]
    pub ml_enabled: bool,
    /// Decision threshold applied to the rule score under `ensemble_vote`.
    #[serde(default = "default_decision_threshold")]
    pub rule_threshold: f64,
    /// Decision threshold applied to the model score under `ensemble_vote`.
    #[serde(default = "default_decision_threshold")]
    pub ml_threshold: f64,
    /// Combined-score threshold for `weighted_average` and `max`.
    #[serde(default = "default_decision_threshold")]
    pub flag_threshold: f64,
}

impl Default for HybridScoringConfig {
    fn default() -> Self {
        Self {
            strategy: HybridStrategy::default(),
            rule_weight: default_rule_weight(),
            ml_weight: default_ml_weight(),
            ml_enabled: true,
            rule_threshold: default_decision_threshold(),
            ml_threshold: default_decision_threshold(),
            flag_threshold: default_decision_threshold(),
        }
    }
}

fn default_rule_weight() -> f64 {
    0.6
}

fn default_ml_weight() -> f64 {
    0.4
}

fn default_decision_threshold() -> f64 {
    0.6
}

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(default = "default_champion_pct")]
    pub champion_pct: f64,
    #[serde(default)]
    pub challenger_pct: f64,
    /// Per-variant observation window used for summaries.
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    #[serde(default)]
    pub auto_promotion: AutoPromotionConfig,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            champion_pct: default_champion_pct(),
            challenger_pct: 0.0,
            metrics_capacity: default_metrics_capacity(),
            auto_promotion: AutoPromotionConfig::default(),
        }
    }
}

fn default_champion_pct() -> f64 {
    100.0
}

fn default_metrics_capacity() -> usize {
    10_000
}

/// Automatic challenger promotion. The significance test behind it does not
/// exist yet; see `TrafficRouter::check_auto_promotion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPromotionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_promotion_observations")]
    pub min_observations: usize,
    #[serde(default = "default_promotion_metric")]
    pub metric: String,
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

impl Default for AutoPromotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_observations: default_min_promotion_observations(),
            metric: default_promotion_metric(),
            improvement_threshold: default_improvement_threshold(),
            confidence_level: default_confidence_level(),
        }
    }
}

fn default_min_promotion_observations() -> usize {
    1_000
}

fn default_promotion_metric() -> String {
    "precision".to_string()
}

fn default_improvement_threshold() -> f64 {
    0.05
}

fn default_confidence_level() -> f64 {
    0.95
}

/// Configuration for feature drift detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_psi_warning")]
    pub psi_warning_threshold: f64,
    #[serde(default = "default_psi_critical")]
    pub psi_critical_threshold: f64,
    #[serde(default = "default_num_bins")]
    pub num_bins: usize,
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    #[serde(default = "default_check_interval")]
    pub check_interval: usize,
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            psi_warning_threshold: default_psi_warning(),
            psi_critical_threshold: default_psi_critical(),
            num_bins: default_num_bins(),
            min_observations: default_min_observations(),
            check_interval: default_check_interval(),
            max_observations: default_max_observations(),
            alert_capacity: default_alert_capacity(),
        }
    }
}

fn default_psi_warning() -> f64 {
    0.10
}

fn default_psi_critical() -> f64 {
    0.25
}

fn default_num_bins() -> usize {
    10
}

fn default_min_observations() -> usize {
    100
}

fn default_check_interval() -> usize {
    500
}

fn default_max_observations() -> usize {
    50_000
}

fn default_alert_capacity() -> usize {
    crate::alerts::DEFAULT_ALERT_CAPACITY
}

/// Configuration for output monitoring thresholds and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Warning threshold on |z|; the critical threshold is derived from it.
    #[serde(default = "default_shift_threshold")]
    pub score_shift_std_threshold: f64,
    #[serde(default = "default_sla_p95")]
    pub latency_sla_p95_ms: f64,
    #[serde(default = "default_sla_p99")]
    pub latency_sla_p99_ms: f64,
    #[serde(default = "default_monitor_max_observations")]
    pub max_observations: usize,
    /// Alerts are evaluated every `check_interval` recorded predictions.
    #[serde(default = "default_monitor_check_interval")]
    pub check_interval: usize,
    /// Minimum samples in the alert window before any check fires.
    #[serde(default = "default_min_window_count")]
    pub min_window_count: usize,
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            score_shift_std_threshold: default_shift_threshold(),
            latency_sla_p95_ms: default_sla_p95(),
            latency_sla_p99_ms: default_sla_p99(),
            max_observations: default_monitor_max_observations(),
            check_interval: default_monitor_check_interval(),
            min_window_count: default_min_window_count(),
            alert_capacity: default_alert_capacity(),
        }
    }
}

fn default_shift_threshold() -> f64 {
    2.0
}

fn default_sla_p95() -> f64 {
    200.0
}

fn default_sla_p99() -> f64 {
    500.0
}

fn default_monitor_max_observations() -> usize {
    100_000
}

fn default_monitor_check_interval() -> usize {
    100
}

fn default_min_window_count() -> usize {
    10
}

/// Validation and promotion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_validation_set_size")]
    pub validation_set_size: usize,
    #[serde(default = "default_validation_seed")]
    pub validation_seed: u64,
    #[serde(default = "default_sla_p95")]
    pub latency_sla_ms: f64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            validation_set_size: default_validation_set_size(),
            validation_seed: default_validation_seed(),
            latency_sla_ms: default_sla_p95(),
        }
    }
}

fn default_validation_set_size() -> usize {
    100
}

fn default_validation_seed() -> u64 {
    42
}

/// On-disk locations, relative to the workspace unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> String {
    ".scoreplane/state".to_string()
}

impl StorageConfig {
    pub fn resolve(&self, workspace: &Path) -> PathBuf {
        let dir = PathBuf::from(&self.state_dir);
        if dir.is_absolute() {
            dir
        } else {
            workspace.join(dir)
        }
    }

    pub fn registry_path(&self, workspace: &Path) -> PathBuf {
        self.resolve(workspace).join("registry.json")
    }

    pub fn audit_path(&self, workspace: &Path) -> PathBuf {
        self.resolve(workspace).join("deployments.jsonl")
    }

    pub fn snapshot_dir(&self, workspace: &Path) -> PathBuf {
        self.resolve(workspace).join("snapshots")
    }
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `SCOREPLANE_`, `__` for nesting)
/// 3. Explicit config file, or workspace-local `.scoreplane/config.toml`
/// 4. User config (`~/.config/scoreplane/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&ServingConfig>,
) -> Result<ServingConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ServingConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "scoreplane", "scoreplane") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".scoreplane").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    // SCOREPLANE_MODEL__NAME, SCOREPLANE_DRIFT__NUM_BINS, ...
    figment = figment.merge(Env::prefixed("SCOREPLANE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_serving_config() {
        let config = ServingConfig::default();
        assert_eq!(config.model.stage, ModelStage::Production);
        assert_eq!(config.model.fallback_stage, Some(ModelStage::Staging));
        assert_eq!(config.features.features.len(), 11);
        assert_eq!(config.routing.champion_pct, 100.0);
        assert_eq!(config.routing.challenger_pct, 0.0);
        assert_eq!(config.drift.num_bins, 10);
        assert_eq!(config.drift.check_interval, 500);
        assert_eq!(config.monitoring.latency_sla_p99_ms, 500.0);
        assert_eq!(config.deployment.validation_set_size, 100);
        assert!(config.hybrid.ml_enabled);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ServingConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.model.name, config.model.name);
        assert_eq!(parsed.features.names(), config.features.names());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: ServingConfig = toml_from_str(
            r#"
            [drift]
            num_bins = 20

            [hybrid]
            strategy = "max"
            "#,
        );
        assert_eq!(parsed.drift.num_bins, 20);
        assert_eq!(parsed.drift.min_observations, 100);
        assert_eq!(parsed.hybrid.strategy, HybridStrategy::Max);
        assert_eq!(parsed.hybrid.rule_weight, 0.6);
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".scoreplane");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[model]\nname = \"aml-screener\"\nprediction_timeout_ms = 250\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.model.name, "aml-screener");
        assert_eq!(config.model.prediction_timeout_ms, 250);
        assert_eq!(config.model.reload_interval_secs, 300);
    }

    #[test]
    fn test_storage_paths_resolve_under_workspace() {
        let storage = StorageConfig::default();
        let ws = Path::new("/srv/ws");
        assert_eq!(
            storage.audit_path(ws),
            PathBuf::from("/srv/ws/.scoreplane/state/deployments.jsonl")
        );
    }

    fn toml_from_str(s: &str) -> ServingConfig {
        Figment::from(Serialized::defaults(ServingConfig::default()))
            .merge(Toml::string(s))
            .extract()
            .unwrap()
    }
}
