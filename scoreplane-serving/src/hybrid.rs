//! Combining a rule-based score with a model score.
//!
//! Rule-only scoring is the degradation path: with the model disabled, not
//! loaded, or failing, the rule score stands alone.

use crate::config::{HybridScoringConfig, ScoringThresholds};
use serde::{Deserialize, Serialize};

/// How the rule and model scores are blended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridStrategy {
    /// `rule_weight · rule + ml_weight · ml`.
    #[default]
    WeightedAverage,
    Max,
    /// Flag only when both scores clear their own threshold.
    EnsembleVote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    RulesOnly,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn from_score(score: f64, thresholds: &ScoringThresholds) -> Self {
        if score < thresholds.low_max {
            Self::Low
        } else if score < thresholds.medium_max {
            Self::Medium
        } else if score < thresholds.high_max {
            Self::High
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridDecision {
    /// Combined score, capped at 1.0.
    pub score: f64,
    pub source: ScoreSource,
    pub flagged: bool,
    pub risk_tier: RiskTier,
    pub rule_score: f64,
    pub ml_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HybridScorer {
    config: HybridScoringConfig,
    thresholds: ScoringThresholds,
}

impl HybridScorer {
    pub fn new(config: HybridScoringConfig, thresholds: ScoringThresholds) -> Self {
        Self { config, thresholds }
    }

    pub fn config(&self) -> &HybridScoringConfig {
        &self.config
    }

    /// Combine `rule_score` with `ml_score`. `None` (no model, load error or
    /// prediction error upstream) yields the rule score alone.
    pub fn combine(&self, rule_score: f64, ml_score: Option<f64>) -> HybridDecision {
        let ml = ml_score.filter(|s| self.config.ml_enabled && s.is_finite());
        let Some(ml) = ml else {
            return HybridDecision {
                score: rule_score,
                source: ScoreSource::RulesOnly,
                flagged: rule_score >= self.config.flag_threshold,
                risk_tier: RiskTier::from_score(rule_score, &self.thresholds),
                rule_score,
                ml_score: None,
            };
        };

        let (raw, flagged) = match self.config.strategy {
            HybridStrategy::WeightedAverage => {
                let s = self.config.rule_weight * rule_score + self.config.ml_weight * ml;
                (s, s.min(1.0) >= self.config.flag_threshold)
            }
            HybridStrategy::Max => {
                let s = rule_score.max(ml);
                (s, s.min(1.0) >= self.config.flag_threshold)
            }
            HybridStrategy::EnsembleVote => (
                (rule_score + ml) / 2.0,
                rule_score > self.config.rule_threshold && ml > self.config.ml_threshold,
            ),
        };
        let score = raw.min(1.0);
        HybridDecision {
            score,
            source: ScoreSource::Hybrid,
            flagged,
            risk_tier: RiskTier::from_score(score, &self.thresholds),
            rule_score,
            ml_score: Some(ml),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(strategy: HybridStrategy) -> HybridScorer {
        let config = HybridScoringConfig {
            strategy,
            ..HybridScoringConfig::default()
        };
        HybridScorer::new(config, ScoringThresholds::default())
    }

    #[test]
    fn test_weighted_average() {
        let d = scorer(HybridStrategy::WeightedAverage).combine(0.5, Some(1.0));
        assert!((d.score - 0.7).abs() < 1e-12);
        assert_eq!(d.source, ScoreSource::Hybrid);
        assert!(d.flagged);
        assert_eq!(d.risk_tier, RiskTier::High);
    }

    #[test]
    fn test_weighted_average_is_capped() {
        let config = HybridScoringConfig {
            rule_weight: 1.0,
            ml_weight: 1.0,
            ..HybridScoringConfig::default()
        };
        let d = HybridScorer::new(config, ScoringThresholds::default()).combine(0.9, Some(0.9));
        assert_eq!(d.score, 1.0);
        assert_eq!(d.risk_tier, RiskTier::Critical);
    }

    #[test]
    fn test_max_strategy() {
        let d = scorer(HybridStrategy::Max).combine(0.2, Some(0.65));
        assert_eq!(d.score, 0.65);
        assert!(d.flagged);
    }

    #[test]
    fn test_ensemble_requires_both() {
        let s = scorer(HybridStrategy::EnsembleVote);
        let one = s.combine(0.9, Some(0.1));
        assert!(!one.flagged);
        assert!((one.score - 0.5).abs() < 1e-12);
        assert!(s.combine(0.7, Some(0.8)).flagged);
    }

    #[test]
    fn test_rule_fallback() {
        let d = scorer(HybridStrategy::Max).combine(0.42, None);
        assert_eq!(d.score, 0.42);
        assert_eq!(d.source, ScoreSource::RulesOnly);
        assert_eq!(d.risk_tier, RiskTier::Medium);

        let disabled = HybridScorer::new(
            HybridScoringConfig {
                ml_enabled: false,
                ..HybridScoringConfig::default()
            },
            ScoringThresholds::default(),
        );
        let d = disabled.combine(0.1, Some(0.99));
        assert_eq!(d.score, 0.1);
        assert_eq!(d.ml_score, None);
    }

    #[test]
    fn test_non_finite_model_score_ignored() {
        let d = scorer(HybridStrategy::Max).combine(0.3, Some(f64::NAN));
        assert_eq!(d.source, ScoreSource::RulesOnly);
    }
}
