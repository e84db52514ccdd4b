//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::RegistryAction;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scoreplane_serving::config::FeatureSpec;
use scoreplane_serving::deploy::synthetic_events;
use scoreplane_serving::registry::TrainingMetadata;
use scoreplane_serving::{
    AuditTrail, ControlPlane, DeploymentPipeline, DeploymentRecord, FeatureVector, LocalRegistry,
    ModelArtifact, ModelRegistry, ModelStage, RiskTier, RoutingConfig, ServingConfig,
    SnapshotStore, load_config,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Rows in the drift reference / baseline set built for a simulation.
const SIMULATION_REFERENCE_SIZE: usize = 2_000;

/// Configuration plus the on-disk state of one workspace.
struct Workspace {
    root: PathBuf,
    config: ServingConfig,
    registry: Arc<LocalRegistry>,
}

impl Workspace {
    fn open(root: &Path, config_file: Option<&Path>) -> anyhow::Result<Self> {
        let config = load_config(Some(root), config_file, None)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        let registry = LocalRegistry::open(&config.storage.registry_path(root))?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            registry: Arc::new(registry),
        })
    }

    fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.config.storage.snapshot_dir(&self.root))
    }

    fn pipeline(&self) -> anyhow::Result<DeploymentPipeline> {
        let audit = AuditTrail::open(&self.config.storage.audit_path(&self.root))?;
        Ok(
            DeploymentPipeline::new(self.registry.clone(), &self.config, audit)
                .with_snapshots(self.snapshots()),
        )
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        command => {
            let ws = Workspace::open(workspace, config_file)?;
            handle_stateful(command, &ws).await
        }
    }
}

/// Commands that operate on the workspace registry and audit trail.
async fn handle_stateful(command: Commands, ws: &Workspace) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, &ws.root, None),
        Commands::Registry { action } => handle_registry(action, ws).await,
        Commands::Validate {
            name,
            version,
            sla_ms,
        } => {
            let result = ws.pipeline()?.validate(&name, version, sla_ms).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.passed {
                anyhow::bail!("Validation failed: {:?}", result.failed_checks());
            }
            Ok(())
        }
        Commands::Promote {
            name,
            version,
            by,
            skip_validation,
        } => {
            let record = ws
                .pipeline()?
                .promote(&name, version, &by, skip_validation)
                .await?;
            print_record(&record);
            Ok(())
        }
        Commands::Rollback { name, by } => {
            let record = ws.pipeline()?.rollback(&name, &by).await?;
            print_record(&record);
            Ok(())
        }
        Commands::Archive { name, version, by } => {
            let record = ws.pipeline()?.archive(&name, version, &by).await?;
            print_record(&record);
            Ok(())
        }
        Commands::Stage { name, version, by } => {
            let record = ws.pipeline()?.stage_candidate(&name, version, &by).await?;
            print_record(&record);
            Ok(())
        }
        Commands::History { name } => {
            let records = ws.pipeline()?.history(name.as_deref());
            if records.is_empty() {
                println!("No deployment records.");
            }
            for record in &records {
                print_record(record);
            }
            Ok(())
        }
        Commands::Simulate {
            requests,
            challenger_pct,
            amount_scale,
            seed,
        } => simulate(ws, requests, challenger_pct, amount_scale, seed).await,
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".scoreplane");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ServingConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_registry(action: RegistryAction, ws: &Workspace) -> anyhow::Result<()> {
    match action {
        RegistryAction::List { name } => {
            let name = name.unwrap_or_else(|| ws.config.model.name.clone());
            let versions = ws.registry.list_versions(&name, None).await?;
            if versions.is_empty() {
                println!("No versions registered for '{}'.", name);
                return Ok(());
            }
            println!("{} ({} versions):", name, versions.len());
            for v in &versions {
                println!(
                    "  v{:<4} {:<10} registered {}  dataset {}",
                    v.version,
                    v.stage.as_str(),
                    v.registered_at.format("%Y-%m-%d %H:%M:%S"),
                    short_hash(&v.metadata.dataset_hash),
                );
            }
            Ok(())
        }
        RegistryAction::Seed => {
            let name = ws.config.model.name.clone();
            let existing = ws.registry.list_versions(&name, None).await?;
            if !existing.is_empty() {
                println!(
                    "Registry already has {} version(s) of '{}'; not seeding.",
                    existing.len(),
                    name
                );
                return Ok(());
            }

            let features = ws.config.features.names();
            let incumbent = ws
                .registry
                .register(
                    &name,
                    demo_artifact(&ws.config.features, 1.0),
                    TrainingMetadata::new(features.clone())
                        .with_dataset(b"demo-training-set-1")
                        .with_metric("auc", 0.91),
                )
                .await?;
            let candidate = ws
                .registry
                .register(
                    &name,
                    demo_artifact(&ws.config.features, 1.4),
                    TrainingMetadata::new(features)
                        .with_dataset(b"demo-training-set-2")
                        .with_metric("auc", 0.93),
                )
                .await?;

            for version in [incumbent.version, candidate.version] {
                ws.registry
                    .transition_stage(&name, version, ModelStage::Staging)
                    .await?;
            }
            ws.registry
                .transition_stage(&name, incumbent.version, ModelStage::Production)
                .await?;

            info!(name = %name, "Demo models registered");
            println!(
                "Registered '{}' v{} (Production) and v{} (Staging).",
                name, incumbent.version, candidate.version
            );
            Ok(())
        }
    }
}

/// Logistic demo model: every feature contributes in proportion to where it
/// sits in its configured range; amount and velocity features weigh more.
fn demo_artifact(spec: &FeatureSpec, sharpness: f64) -> ModelArtifact {
    let weights = spec
        .features
        .iter()
        .map(|f| {
            let span = (f.max - f.min).abs().max(1.0);
            let weight = if f.name.starts_with("amount") || f.name.starts_with("velocity") {
                0.8 * sharpness
            } else {
                0.1
            };
            weight / span
        })
        .collect();
    ModelArtifact::Logistic {
        weights,
        bias: -3.0,
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn print_record(record: &DeploymentRecord) {
    let version = record
        .model_version
        .map(|v| format!("v{v}"))
        .unwrap_or_else(|| "-".to_string());
    let previous = record
        .previous_version
        .map(|v| format!("v{v}"))
        .unwrap_or_else(|| "-".to_string());
    let status = if record.success { "ok" } else { "FAILED" };
    println!(
        "#{:<4} {} {:<8} {} {} (from {}) by {} [{}]",
        record.sequence,
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.action.as_str(),
        record.model_name,
        version,
        previous,
        record.triggered_by,
        status,
    );
    if let Some(error) = &record.error {
        println!("      error: {}", error);
    }
}

/// Score synthetic traffic end to end and print the resulting routing
/// metrics and monitoring report.
async fn simulate(
    ws: &Workspace,
    requests: usize,
    challenger_pct: Option<f64>,
    amount_scale: f64,
    seed: u64,
) -> anyhow::Result<()> {
    let config = ws.config.clone();
    let plane = ControlPlane::new(
        config.clone(),
        ws.registry.clone(),
        AuditTrail::in_memory(),
        Some(ws.snapshots()),
    )?;

    let (champion, challenger) = plane.start().await;
    if !champion.success && !challenger.success {
        anyhow::bail!(
            "No model could be loaded for '{}': {}",
            config.model.name,
            champion.error.unwrap_or_default()
        );
    }
    if !challenger.success {
        info!("No challenger loaded; all traffic goes to the champion");
    }
    if let Some(pct) = challenger_pct {
        plane.set_routing(RoutingConfig::split(100.0 - pct, pct))?;
    }

    let cancel = CancellationToken::new();
    let reload_loops = plane.spawn_reload_loops(&cancel);

    let names = config.features.names();
    let reference = synthetic_events(
        &names,
        &config.features,
        SIMULATION_REFERENCE_SIZE,
        config.deployment.validation_seed,
    );
    let features = plane.set_reference_sample(&reference)?;
    info!(features, "Drift references set from the reference sample");

    let traffic = synthetic_events(&names, &config.features, requests, seed);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let mut tiers: BTreeMap<RiskTier, usize> = BTreeMap::new();
    let mut flagged = 0usize;
    for event in &traffic {
        let event = scale_feature(event, "amount", amount_scale);
        let entity_id = format!("acct-{:06}", rng.gen_range(0..100_000u32));
        let rule_score: f64 = rng.gen_range(0.0..1.0);
        let decision = plane.score_event(&entity_id, rule_score, &event).await;
        if decision.flagged {
            flagged += 1;
        }
        *tiers.entry(decision.risk_tier).or_default() += 1;
    }

    cancel.cancel();
    for handle in reload_loops {
        let _ = handle.await;
    }

    let summary = serde_json::json!({
        "requests": requests,
        "flagged": flagged,
        "risk_tiers": tiers,
        "routing": plane.get_routing(),
        "report": plane.get_monitoring_report(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn scale_feature(event: &FeatureVector, feature: &str, factor: f64) -> FeatureVector {
    let values = event
        .iter()
        .map(|(name, value)| if name == feature { value * factor } else { value })
        .collect();
    FeatureVector::new(event.names().to_vec(), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn seeded() -> TempDir {
        let dir = TempDir::new().unwrap();
        handle_command(
            Commands::Registry {
                action: RegistryAction::Seed,
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();
        dir
    }

    async fn stages(dir: &TempDir) -> Vec<(u32, ModelStage)> {
        let ws = Workspace::open(dir.path(), None).unwrap();
        ws.registry
            .list_versions(&ws.config.model.name, None)
            .await
            .unwrap()
            .into_iter()
            .map(|v| (v.version, v.stage))
            .collect()
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        handle_command(
            Commands::Config {
                action: ConfigAction::Init,
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();

        let config_path = dir.path().join(".scoreplane").join("config.toml");
        assert!(config_path.exists());

        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: ServingConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.features.names(), ServingConfig::default().features.names());
    }

    #[tokio::test]
    async fn test_seed_registers_two_versions() {
        let dir = seeded().await;
        assert_eq!(
            stages(&dir).await,
            vec![(1, ModelStage::Production), (2, ModelStage::Staging)]
        );

        // Seeding twice leaves the registry alone.
        handle_command(
            Commands::Registry {
                action: RegistryAction::Seed,
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(stages(&dir).await.len(), 2);
    }

    #[tokio::test]
    async fn test_promote_then_rollback_persists() {
        let dir = seeded().await;
        let name = ServingConfig::default().model.name;

        handle_command(
            Commands::Promote {
                name: name.clone(),
                version: 2,
                by: "test".into(),
                skip_validation: false,
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            stages(&dir).await,
            vec![(1, ModelStage::Archived), (2, ModelStage::Production)]
        );

        handle_command(
            Commands::Rollback {
                name: name.clone(),
                by: "test".into(),
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            stages(&dir).await,
            vec![(1, ModelStage::Production), (2, ModelStage::Archived)]
        );

        let ws = Workspace::open(dir.path(), None).unwrap();
        let history = ws.pipeline().unwrap().history(Some(&name));
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.success));
        assert!(ws.snapshots().load(&name, 2).unwrap().unwrap().baseline.is_some());
    }

    #[tokio::test]
    async fn test_validate_rejects_production_version() {
        let dir = seeded().await;
        let result = handle_command(
            Commands::Validate {
                name: ServingConfig::default().model.name,
                version: 1,
                sla_ms: None,
            },
            dir.path(),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_simulate_runs_on_seeded_workspace() {
        let dir = seeded().await;
        handle_command(
            Commands::Simulate {
                requests: 200,
                challenger_pct: Some(30.0),
                amount_scale: 1.0,
                seed: 3,
            },
            dir.path(),
            None,
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_scale_feature_only_touches_named_feature() {
        let event = FeatureVector::from_pairs([("amount", 10.0), ("hour_of_day", 3.0)]);
        let scaled = scale_feature(&event, "amount", 2.5);
        assert_eq!(scaled.values(), &[25.0, 3.0]);
        assert_eq!(scaled.names(), event.names());
    }

    #[test]
    fn test_demo_artifact_matches_feature_count() {
        let spec = ServingConfig::default().features;
        match demo_artifact(&spec, 1.0) {
            ModelArtifact::Logistic { weights, .. } => assert_eq!(weights.len(), spec.features.len()),
            other => panic!("unexpected artifact: {other:?}"),
        }
    }
}
