//! In-process registry, optionally persisted as a JSON catalog.

use super::{ModelArtifact, ModelRegistry, ModelStage, ModelVersion, TrainingMetadata};
use crate::error::{Result, ServingError};
use crate::model::{ScoringModel, build_model};
use crate::persistence;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const IN_PROCESS_SCHEME: &str = "inproc://";
const CATALOG_SCHEME: &str = "catalog://";

/// On-disk form of the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    versions: Vec<ModelVersion>,
    /// Serializable artifacts keyed by `artifact_reference`.
    artifacts: HashMap<String, ModelArtifact>,
}

/// Registry backed by process memory, with an optional JSON catalog file.
///
/// Enforces the lifecycle transition table and the at-most-one-Production
/// invariant on every stage change.
pub struct LocalRegistry {
    catalog: RwLock<Catalog>,
    /// Predict functions registered directly (not serializable).
    in_process: RwLock<HashMap<String, Arc<dyn ScoringModel>>>,
    path: Option<PathBuf>,
    offline: AtomicBool,
}

impl LocalRegistry {
    /// Empty, memory-only registry.
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            in_process: RwLock::new(HashMap::new()),
            path: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Open (or create) a registry persisted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let catalog: Catalog = persistence::load_json(path)?.unwrap_or_default();
        debug!(path = %path.display(), versions = catalog.versions.len(), "Registry catalog loaded");
        Ok(Self {
            catalog: RwLock::new(catalog),
            in_process: RwLock::new(HashMap::new()),
            path: Some(path.to_path_buf()),
            offline: AtomicBool::new(false),
        })
    }

    /// Simulate the registry becoming unreachable. Every call fails with
    /// `ServingError::Registry` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Register an in-process predict function. Such versions survive only
    /// as long as this registry instance.
    pub fn register_model(
        &self,
        name: &str,
        model: Arc<dyn ScoringModel>,
        metadata: TrainingMetadata,
    ) -> Result<ModelVersion> {
        self.ensure_online()?;
        let mut catalog = self.catalog.write();
        let version = next_version(&catalog, name);
        let reference = format!("{IN_PROCESS_SCHEME}{name}/{version}");
        let entry = new_version(name, version, reference.clone(), metadata);
        self.commit(&mut catalog, |next| {
            next.versions.push(entry.clone());
            Ok(())
        })?;
        self.in_process.write().insert(reference, model);
        info!(name, version, "Model registered (in-process)");
        Ok(entry)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServingError::registry("registry unreachable"));
        }
        Ok(())
    }

    /// Apply `change` to a copy of the catalog, persist the copy, then swap
    /// it in. A failed write leaves memory as it was.
    fn commit<T>(
        &self,
        catalog: &mut Catalog,
        change: impl FnOnce(&mut Catalog) -> Result<T>,
    ) -> Result<T> {
        let mut next = catalog.clone();
        let out = change(&mut next)?;
        self.save(&next)?;
        *catalog = next;
        Ok(out)
    }

    fn save(&self, catalog: &Catalog) -> Result<()> {
        if let Some(path) = &self.path {
            persistence::atomic_write_json(path, catalog)?;
        }
        Ok(())
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn next_version(catalog: &Catalog, name: &str) -> u32 {
    catalog
        .versions
        .iter()
        .filter(|v| v.name == name)
        .map(|v| v.version)
        .max()
        .unwrap_or(0)
        + 1
}

fn new_version(
    name: &str,
    version: u32,
    artifact_reference: String,
    metadata: TrainingMetadata,
) -> ModelVersion {
    let now = Utc::now();
    ModelVersion {
        name: name.to_string(),
        version,
        stage: ModelStage::None,
        artifact_reference,
        metadata,
        registered_at: now,
        stage_updated_at: now,
    }
}

#[async_trait]
impl ModelRegistry for LocalRegistry {
    async fn load(&self, name: &str, stage: ModelStage) -> Result<ModelVersion> {
        self.ensure_online()?;
        self.catalog
            .read()
            .versions
            .iter()
            .filter(|v| v.name == name && v.stage == stage)
            .max_by_key(|v| v.version)
            .cloned()
            .ok_or_else(|| ServingError::not_found(format!("no {stage} version of '{name}'")))
    }

    async fn get(&self, name: &str, version: u32) -> Result<ModelVersion> {
        self.ensure_online()?;
        self.catalog
            .read()
            .versions
            .iter()
            .find(|v| v.name == name && v.version == version)
            .cloned()
            .ok_or_else(|| ServingError::not_found(format!("{name} v{version}")))
    }

    async fn fetch_model(&self, version: &ModelVersion) -> Result<Arc<dyn ScoringModel>> {
        self.ensure_online()?;
        let reference = &version.artifact_reference;
        if reference.starts_with(IN_PROCESS_SCHEME) {
            return self.in_process.read().get(reference).cloned().ok_or_else(|| {
                ServingError::model_load(format!("in-process artifact {reference} is gone"))
            });
        }
        let catalog = self.catalog.read();
        let artifact = catalog
            .artifacts
            .get(reference)
            .ok_or_else(|| ServingError::model_load(format!("artifact {reference} missing")))?;
        Ok(build_model(artifact))
    }

    async fn register(
        &self,
        name: &str,
        artifact: ModelArtifact,
        metadata: TrainingMetadata,
    ) -> Result<ModelVersion> {
        self.ensure_online()?;
        let mut catalog = self.catalog.write();
        let version = next_version(&catalog, name);
        let reference = format!("{CATALOG_SCHEME}{name}/{version}");
        let entry = new_version(name, version, reference.clone(), metadata);
        self.commit(&mut catalog, |next| {
            next.artifacts.insert(reference, artifact);
            next.versions.push(entry.clone());
            Ok(())
        })?;
        info!(name, version, "Model registered");
        Ok(entry)
    }

    async fn transition_stage(
        &self,
        name: &str,
        version: u32,
        new_stage: ModelStage,
    ) -> Result<ModelVersion> {
        self.ensure_online()?;
        let mut catalog = self.catalog.write();

        if new_stage == ModelStage::Production {
            if let Some(other) = catalog.versions.iter().find(|v| {
                v.name == name && v.stage == ModelStage::Production && v.version != version
            }) {
                return Err(ServingError::registry(format!(
                    "{name} v{} is already in Production",
                    other.version
                )));
            }
        }

        let (from, updated) = self.commit(&mut catalog, |next| {
            let entry = next
                .versions
                .iter_mut()
                .find(|v| v.name == name && v.version == version)
                .ok_or_else(|| ServingError::not_found(format!("{name} v{version}")))?;

            if !entry.stage.can_transition_to(new_stage) {
                return Err(ServingError::IllegalTransition {
                    name: name.to_string(),
                    version,
                    from: entry.stage.to_string(),
                    to: new_stage.to_string(),
                });
            }

            let from = entry.stage;
            entry.stage = new_stage;
            entry.stage_updated_at = Utc::now();
            Ok((from, entry.clone()))
        })?;
        info!(name, version, %from, to = %new_stage, "Model stage transitioned");
        Ok(updated)
    }

    async fn list_versions(
        &self,
        name: &str,
        stage: Option<ModelStage>,
    ) -> Result<Vec<ModelVersion>> {
        self.ensure_online()?;
        let mut out: Vec<ModelVersion> = self
            .catalog
            .read()
            .versions
            .iter()
            .filter(|v| v.name == name && stage.is_none_or(|s| v.stage == s))
            .cloned()
            .collect();
        out.sort_by_key(|v| v.version);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConstantModel;
    use tempfile::TempDir;

    fn metadata() -> TrainingMetadata {
        TrainingMetadata::new(vec!["amount".into()])
    }

    #[tokio::test]
    async fn test_versions_increase_per_name() {
        let registry = LocalRegistry::new();
        let a1 = registry
            .register("a", ModelArtifact::Constant { score: 0.1 }, metadata())
            .await
            .unwrap();
        let a2 = registry
            .register("a", ModelArtifact::Constant { score: 0.2 }, metadata())
            .await
            .unwrap();
        let b1 = registry
            .register("b", ModelArtifact::Constant { score: 0.3 }, metadata())
            .await
            .unwrap();
        assert_eq!((a1.version, a2.version, b1.version), (1, 2, 1));
        assert_eq!(a1.stage, ModelStage::None);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let registry = LocalRegistry::new();
        registry
            .register("m", ModelArtifact::Constant { score: 0.1 }, metadata())
            .await
            .unwrap();
        let err = registry
            .transition_stage("m", 1, ModelStage::Production)
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::IllegalTransition { .. }));
        let v = registry.get("m", 1).await.unwrap();
        assert_eq!(v.stage, ModelStage::None);
    }

    #[tokio::test]
    async fn test_single_production_enforced() {
        let registry = LocalRegistry::new();
        for score in [0.1, 0.2] {
            registry
                .register("m", ModelArtifact::Constant { score }, metadata())
                .await
                .unwrap();
        }
        for v in [1, 2] {
            registry
                .transition_stage("m", v, ModelStage::Staging)
                .await
                .unwrap();
        }
        registry
            .transition_stage("m", 1, ModelStage::Production)
            .await
            .unwrap();
        let err = registry
            .transition_stage("m", 2, ModelStage::Production)
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::Registry(_)));

        let prod = registry
            .list_versions("m", Some(ModelStage::Production))
            .await
            .unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].version, 1);
    }

    #[tokio::test]
    async fn test_fetch_model_resolves_artifacts() {
        let registry = LocalRegistry::new();
        let catalog_version = registry
            .register("m", ModelArtifact::Constant { score: 0.25 }, metadata())
            .await
            .unwrap();
        let inproc_version = registry
            .register_model("m", Arc::new(ConstantModel::new(0.75)), metadata())
            .unwrap();

        let a = registry.fetch_model(&catalog_version).await.unwrap();
        let b = registry.fetch_model(&inproc_version).await.unwrap();
        assert_eq!(a.predict(&[0.0]), 0.25);
        assert_eq!(b.predict(&[0.0]), 0.75);
    }

    #[tokio::test]
    async fn test_offline_registry_fails_calls() {
        let registry = LocalRegistry::new();
        registry.set_offline(true);
        let err = registry
            .load("m", ModelStage::Production)
            .await
            .unwrap_err();
        assert!(matches!(err, ServingError::Registry(_)));
    }

    #[tokio::test]
    async fn test_catalog_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = LocalRegistry::open(&path).unwrap();
            registry
                .register(
                    "m",
                    ModelArtifact::Logistic {
                        weights: vec![0.1],
                        bias: 0.0,
                    },
                    metadata(),
                )
                .await
                .unwrap();
            registry
                .transition_stage("m", 1, ModelStage::Staging)
                .await
                .unwrap();
        }

        let reopened = LocalRegistry::open(&path).unwrap();
        let staged = reopened.load("m", ModelStage::Staging).await.unwrap();
        assert_eq!(staged.version, 1);
        let model = reopened.fetch_model(&staged).await.unwrap();
        assert!((model.predict(&[0.0]) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = LocalRegistry::open(&path).unwrap();
        registry
            .register_model("m", Arc::new(ConstantModel::new(0.2)), metadata())
            .unwrap();

        // The temp file the catalog is staged through can no longer be created.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();

        assert!(matches!(
            registry.transition_stage("m", 1, ModelStage::Staging).await,
            Err(ServingError::Io(_))
        ));
        assert_eq!(registry.get("m", 1).await.unwrap().stage, ModelStage::None);

        assert!(registry
            .register("m", ModelArtifact::Constant { score: 0.3 }, metadata())
            .await
            .is_err());
        assert!(registry
            .register_model("m", Arc::new(ConstantModel::new(0.4)), metadata())
            .is_err());
        assert_eq!(registry.list_versions("m", None).await.unwrap().len(), 1);

        std::fs::remove_dir(path.with_extension("tmp")).unwrap();
        let staged = registry
            .transition_stage("m", 1, ModelStage::Staging)
            .await
            .unwrap();
        assert_eq!(staged.stage, ModelStage::Staging);
        let next = registry
            .register_model("m", Arc::new(ConstantModel::new(0.4)), metadata())
            .unwrap();
        assert_eq!(next.version, 2);
    }
}
