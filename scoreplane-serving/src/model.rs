//! Predict functions and the feature vectors they consume.

use crate::registry::ModelArtifact;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A loaded model's predict function.
///
/// Implementations are invoked on a blocking thread and may be slow; the
/// serving node bounds each call with its prediction timeout. The raw output
/// is not required to be finite or in [0, 1].
pub trait ScoringModel: Send + Sync + 'static {
    fn predict(&self, features: &[f64]) -> f64;

    /// Short label for logs.
    fn kind(&self) -> &str {
        "custom"
    }
}

/// Ordered, named numeric features for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    names: Vec<String>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn new(names: Vec<String>, values: Vec<f64>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self { names, values }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let (names, values): (Vec<_>, Vec<_>) =
            pairs.into_iter().map(|(n, v)| (n.to_string(), v)).unzip();
        Self { names, values }
    }

    /// Build a vector in `order`, taking values from `map` and defaulting
    /// missing features to 0.0.
    pub fn ordered(order: &[String], map: &HashMap<String, f64>) -> Self {
        let values = order
            .iter()
            .map(|n| map.get(n).copied().unwrap_or(0.0))
            .collect();
        Self {
            names: order.to_vec(),
            values,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Whether names match `expected` exactly, including order.
    pub fn matches_schema(&self, expected: &[String]) -> bool {
        self.names.len() == self.values.len() && self.names == expected
    }
}

/// Logistic regression: `sigmoid(bias + w · x)`.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticModel {
    pub fn new(weights: Vec<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }
}

impl ScoringModel for LogisticModel {
    fn predict(&self, features: &[f64]) -> f64 {
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }

    fn kind(&self) -> &str {
        "logistic"
    }
}

/// Returns the same score for every input.
#[derive(Debug, Clone, Copy)]
pub struct ConstantModel {
    score: f64,
}

impl ConstantModel {
    pub fn new(score: f64) -> Self {
        Self { score }
    }
}

impl ScoringModel for ConstantModel {
    fn predict(&self, _features: &[f64]) -> f64 {
        self.score
    }

    fn kind(&self) -> &str {
        "constant"
    }
}

/// Materialize a serializable artifact into a predict function.
pub fn build_model(artifact: &ModelArtifact) -> Arc<dyn ScoringModel> {
    match artifact {
        ModelArtifact::Logistic { weights, bias } => {
            Arc::new(LogisticModel::new(weights.clone(), *bias))
        }
        ModelArtifact::Constant { score } => Arc::new(ConstantModel::new(*score)),
    }
}
