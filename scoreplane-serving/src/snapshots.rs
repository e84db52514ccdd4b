//! Persisted baselines and reference distributions, keyed by model
//! name + version.
//!
//! Layout: `<dir>/<name>/v<version>.json`.

use crate::drift::ReferenceDistribution;
use crate::error::Result;
use crate::monitoring::Baseline;
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_name: String,
    pub model_version: u32,
    pub baseline: Option<Baseline>,
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceDistribution>,
    pub saved_at: DateTime<Utc>,
}

impl ModelSnapshot {
    pub fn new(model_name: &str, model_version: u32) -> Self {
        Self {
            model_name: model_name.to_string(),
            model_version,
            baseline: None,
            references: BTreeMap::new(),
            saved_at: Utc::now(),
        }
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str, version: u32) -> PathBuf {
        self.dir.join(name).join(format!("v{version}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.model_name, snapshot.model_version);
        persistence::atomic_write_json(&path, snapshot)?;
        debug!(path = %path.display(), "Model snapshot saved");
        Ok(())
    }

    pub fn load(&self, name: &str, version: u32) -> Result<Option<ModelSnapshot>> {
        Ok(persistence::load_json(&self.path_for(name, version))?)
    }

    /// Merge `baseline` into the snapshot for (name, version), keeping any
    /// stored references.
    pub fn save_baseline(&self, name: &str, version: u32, baseline: &Baseline) -> Result<()> {
        let mut snapshot = self
            .load(name, version)?
            .unwrap_or_else(|| ModelSnapshot::new(name, version));
        snapshot.baseline = Some(baseline.clone());
        snapshot.saved_at = Utc::now();
        self.save(&snapshot)
    }

    /// Merge reference distributions into the snapshot for (name, version).
    pub fn save_references(
        &self,
        name: &str,
        version: u32,
        references: BTreeMap<String, ReferenceDistribution>,
    ) -> Result<()> {
        let mut snapshot = self
            .load(name, version)?
            .unwrap_or_else(|| ModelSnapshot::new(name, version));
        snapshot.references.extend(references);
        snapshot.saved_at = Utc::now();
        self.save(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load("m", 1).unwrap().is_none());
    }

    #[test]
    fn test_baseline_and_references_merge() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        let baseline = Baseline::from_scores(&[0.1, 0.2, 0.3], Some(4)).unwrap();
        store.save_baseline("fraud", 4, &baseline).unwrap();

        let values: Vec<f64> = (0..100).map(f64::from).collect();
        let reference = ReferenceDistribution::from_values(&values, 10).unwrap();
        let mut refs = BTreeMap::new();
        refs.insert("amount".to_string(), reference.clone());
        store.save_references("fraud", 4, refs).unwrap();

        let snapshot = store.load("fraud", 4).unwrap().unwrap();
        assert_eq!(snapshot.baseline, Some(baseline));
        assert_eq!(snapshot.references["amount"], reference);
        assert!(dir.path().join("fraud").join("v4.json").exists());
    }
}
