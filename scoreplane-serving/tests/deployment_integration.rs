//! Governance flows across registry, pipeline, audit trail and control plane.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use scoreplane_serving::audit::{AuditTrail, DeploymentAction};
use scoreplane_serving::deploy::synthetic_events;
use scoreplane_serving::model::ConstantModel;
use scoreplane_serving::monitoring::Baseline;
use scoreplane_serving::registry::{LocalRegistry, ModelRegistry, ModelStage, TrainingMetadata};
use scoreplane_serving::routing::{RoutingConfig, Variant};
use scoreplane_serving::{
    ControlPlane, DeploymentPipeline, ServingConfig, ServingError, Severity, SnapshotStore,
};

const NAME: &str = "risk-scorer";

fn config() -> ServingConfig {
    let mut config = ServingConfig::default();
    config.model.name = NAME.to_string();
    config
}

async fn register(registry: &LocalRegistry, score: f64, stage: ModelStage) -> u32 {
    let mv = registry
        .register_model(
            NAME,
            Arc::new(ConstantModel::new(score)),
            TrainingMetadata::new(config().features.names()),
        )
        .unwrap();
    if stage != ModelStage::None {
        registry
            .transition_stage(NAME, mv.version, ModelStage::Staging)
            .await
            .unwrap();
    }
    if matches!(stage, ModelStage::Production | ModelStage::Archived) {
        registry
            .transition_stage(NAME, mv.version, ModelStage::Production)
            .await
            .unwrap();
    }
    if stage == ModelStage::Archived {
        registry
            .transition_stage(NAME, mv.version, ModelStage::Archived)
            .await
            .unwrap();
    }
    mv.version
}

async fn stage_of(registry: &LocalRegistry, version: u32) -> ModelStage {
    registry.get(NAME, version).await.unwrap().stage
}

#[tokio::test]
async fn test_failed_validation_leaves_stages_and_one_record() {
    let registry = Arc::new(LocalRegistry::new());
    let incumbent = register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 1.5, ModelStage::Staging).await;

    let pipeline = DeploymentPipeline::new(registry.clone(), &config(), AuditTrail::in_memory());
    let err = pipeline
        .promote(NAME, candidate, "ci", false)
        .await
        .unwrap_err();
    match err {
        ServingError::ValidationFailed { failed_checks, .. } => {
            assert_eq!(failed_checks, vec!["scores_in_range".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(stage_of(&registry, incumbent).await, ModelStage::Production);
    assert_eq!(stage_of(&registry, candidate).await, ModelStage::Staging);

    let history = pipeline.history(Some(NAME));
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert!(!record.success);
    assert_eq!(record.action, DeploymentAction::Promote);
    assert_eq!(record.model_version, Some(candidate));
    assert_eq!(record.previous_version, Some(incumbent));
    assert!(record.error.is_some());
    assert!(!record.validation.as_ref().unwrap().passed);
}

#[tokio::test]
async fn test_rollback_picks_highest_archived() {
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.1, ModelStage::Staging).await;
    register(&registry, 0.2, ModelStage::Archived).await;
    register(&registry, 0.3, ModelStage::Staging).await;
    register(&registry, 0.4, ModelStage::Archived).await;
    register(&registry, 0.5, ModelStage::Production).await;

    let pipeline = DeploymentPipeline::new(registry.clone(), &config(), AuditTrail::in_memory());
    let record = pipeline.rollback(NAME, "oncall").await.unwrap();

    assert_eq!(record.model_version, Some(4));
    assert_eq!(record.previous_version, Some(5));
    assert_eq!(record.action, DeploymentAction::Rollback);
    assert_eq!(stage_of(&registry, 4).await, ModelStage::Production);
    assert_eq!(stage_of(&registry, 5).await, ModelStage::Archived);
    assert_eq!(stage_of(&registry, 2).await, ModelStage::Archived);
}

#[tokio::test]
async fn test_rollback_without_archive_is_recorded() {
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.5, ModelStage::Production).await;

    let pipeline = DeploymentPipeline::new(registry.clone(), &config(), AuditTrail::in_memory());
    let err = pipeline.rollback(NAME, "oncall").await.unwrap_err();
    assert!(matches!(err, ServingError::NoArchivedVersion(_)));

    let history = pipeline.history(None);
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(stage_of(&registry, 1).await, ModelStage::Production);
}

#[tokio::test]
async fn test_concurrent_promotions_keep_single_production() {
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.2, ModelStage::Production).await;
    let a = register(&registry, 0.3, ModelStage::Staging).await;
    let b = register(&registry, 0.4, ModelStage::Staging).await;

    let pipeline = Arc::new(DeploymentPipeline::new(
        registry.clone(),
        &config(),
        AuditTrail::in_memory(),
    ));
    let first = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.promote(NAME, a, "ci", true).await })
    };
    let second = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.promote(NAME, b, "ci", true).await })
    };
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());

    let production = registry
        .list_versions(NAME, Some(ModelStage::Production))
        .await
        .unwrap();
    assert_eq!(production.len(), 1);
    assert_eq!(pipeline.history(Some(NAME)).len(), 2);
}

#[tokio::test]
async fn test_control_plane_promotion_swaps_champion() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 0.6, ModelStage::Staging).await;

    let audit = AuditTrail::open(&dir.path().join("audit.jsonl")).unwrap();
    let plane = ControlPlane::new(
        config(),
        registry.clone(),
        audit,
        Some(SnapshotStore::new(dir.path().join("snapshots"))),
    )
    .unwrap();
    let (champion, challenger) = plane.start().await;
    assert!(champion.success);
    assert!(challenger.success);
    assert_eq!(champion.model_version, Some(1));
    assert_eq!(challenger.model_version, Some(candidate));

    plane.set_routing(RoutingConfig::split(100.0, 0.0)).unwrap();
    let features = plane.features_from_map(&Default::default());
    let before = plane.predict("acct-1", &features).await.unwrap();
    assert_eq!(before.model_version, 1);

    plane
        .pipeline()
        .promote(NAME, candidate, "ci", false)
        .await
        .unwrap();
    let after = plane.predict("acct-1", &features).await.unwrap();
    assert_eq!(after.model_version, candidate);
    assert_eq!(after.score, 0.6);

    // The audit log survives a restart.
    let reopened = AuditTrail::open(&dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(reopened.history(Some(NAME))[0].success);
}

#[tokio::test]
async fn test_routing_update_validation() {
    let registry = Arc::new(LocalRegistry::new());
    let plane = ControlPlane::new(config(), registry, AuditTrail::in_memory(), None).unwrap();

    let applied = plane.set_routing(RoutingConfig::split(60.0, 40.0)).unwrap();
    assert_eq!(applied, RoutingConfig::split(60.0, 40.0));

    let err = plane
        .set_routing(RoutingConfig::split(60.0, 50.0))
        .unwrap_err();
    assert!(matches!(err, ServingError::InvalidRoutingConfig(_)));
    assert_eq!(plane.get_routing().config, RoutingConfig::split(60.0, 40.0));
}

#[tokio::test]
async fn test_challenger_shift_alerts_against_restored_baseline() {
    let dir = TempDir::new().unwrap();
    let snapshots = dir.path().join("snapshots");
    let registry = Arc::new(LocalRegistry::new());
    let champion = register(&registry, 0.26, ModelStage::Production).await;
    register(&registry, 0.55, ModelStage::Staging).await;

    let scores: Vec<f64> = (0..1_000)
        .map(|i| if i % 2 == 0 { 0.13 } else { 0.39 })
        .collect();
    let baseline = Baseline::from_scores(&scores, Some(champion)).unwrap();
    SnapshotStore::new(&snapshots)
        .save_baseline(NAME, champion, &baseline)
        .unwrap();

    let plane = ControlPlane::new(
        config(),
        registry,
        AuditTrail::in_memory(),
        Some(SnapshotStore::new(&snapshots)),
    )
    .unwrap();
    plane.start().await;
    for variant in [Variant::Champion, Variant::Challenger] {
        assert_eq!(plane.monitor(variant).unwrap().baseline(), Some(baseline.clone()));
    }

    plane.set_routing(RoutingConfig::split(0.0, 100.0)).unwrap();
    let features = plane.features_from_map(&Default::default());
    for i in 0..1_000 {
        let response = plane.predict(&format!("acct-{i}"), &features).await.unwrap();
        assert_eq!(response.variant, Variant::Challenger);
    }

    // (0.55 - 0.26) / 0.13 ≈ 2.23: a warning, short of critical.
    let alerts = plane.monitor(Variant::Challenger).unwrap().alerts();
    assert!(!alerts.is_empty());
    assert!(alerts.iter().all(|a| a.metric_name == "score_mean"));
    assert!(alerts.iter().all(|a| a.severity == Severity::Warning));
    assert!(plane.monitor(Variant::Champion).unwrap().alerts().is_empty());
}

#[tokio::test]
async fn test_promoting_challenger_ends_experiment() {
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 0.6, ModelStage::Staging).await;

    let plane = ControlPlane::new(config(), registry, AuditTrail::in_memory(), None).unwrap();
    plane.start().await;
    plane.set_routing(RoutingConfig::split(50.0, 50.0)).unwrap();

    plane
        .pipeline()
        .promote(NAME, candidate, "ci", false)
        .await
        .unwrap();
    plane.reload().await;

    assert!(!plane.challenger().is_loaded());
    assert_eq!(plane.get_routing().config, RoutingConfig::default());
    let features = plane.features_from_map(&Default::default());
    for i in 0..200 {
        let response = plane.predict(&format!("acct-{i}"), &features).await.unwrap();
        assert_eq!(response.variant, Variant::Champion);
        assert_eq!(response.model_version, candidate);
    }
    assert_eq!(plane.get_routing().metrics.challenger.count, 0);
}

#[tokio::test]
async fn test_drift_references_survive_restart() {
    let dir = TempDir::new().unwrap();
    let snapshots = dir.path().join("snapshots");
    let registry = Arc::new(LocalRegistry::new());
    register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 0.3, ModelStage::Staging).await;

    let config = config();
    let training = synthetic_events(&config.features.names(), &config.features, 500, 11);
    let saved = {
        let plane = ControlPlane::new(
            config.clone(),
            registry.clone(),
            AuditTrail::in_memory(),
            Some(SnapshotStore::new(&snapshots)),
        )
        .unwrap();
        plane.start().await;
        let set = plane.set_reference_sample(&training).unwrap();
        assert_eq!(set, config.features.names().len());
        plane.drift().references()
    };

    let restarted = ControlPlane::new(
        config,
        registry,
        AuditTrail::in_memory(),
        Some(SnapshotStore::new(&snapshots)),
    )
    .unwrap();
    assert!(restarted.drift().references().is_empty());
    restarted.start().await;
    assert_eq!(restarted.drift().references(), saved);

    // The promoted version inherits the references in use.
    restarted
        .pipeline()
        .promote(NAME, candidate, "ci", false)
        .await
        .unwrap();
    let snapshot = SnapshotStore::new(&snapshots)
        .load(NAME, candidate)
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.references, saved);
    assert!(snapshot.baseline.is_some());
}

#[tokio::test]
async fn test_registry_write_failure_keeps_stages() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.json");
    let registry = Arc::new(LocalRegistry::open(&path).unwrap());
    let incumbent = register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 0.3, ModelStage::Staging).await;
    std::fs::create_dir(path.with_extension("tmp")).unwrap();

    let pipeline = DeploymentPipeline::new(registry.clone(), &config(), AuditTrail::in_memory());
    let err = pipeline
        .promote(NAME, candidate, "ci", true)
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Io(_)));
    assert_eq!(stage_of(&registry, incumbent).await, ModelStage::Production);
    assert_eq!(stage_of(&registry, candidate).await, ModelStage::Staging);

    let history = pipeline.history(Some(NAME));
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
}

#[tokio::test]
async fn test_audit_write_failure_still_reports_promotion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit.jsonl");
    let registry = Arc::new(LocalRegistry::new());
    let incumbent = register(&registry, 0.2, ModelStage::Production).await;
    let candidate = register(&registry, 0.3, ModelStage::Staging).await;

    let pipeline = DeploymentPipeline::new(
        registry.clone(),
        &config(),
        AuditTrail::open(&path).unwrap(),
    );
    std::fs::create_dir(&path).unwrap();

    let record = pipeline
        .promote(NAME, candidate, "ci", false)
        .await
        .unwrap();
    assert!(record.success);
    assert_eq!(record.model_version, Some(candidate));
    assert_eq!(stage_of(&registry, candidate).await, ModelStage::Production);
    assert_eq!(stage_of(&registry, incumbent).await, ModelStage::Archived);
    assert_eq!(pipeline.history(Some(NAME)), vec![record]);
}
