// Promotion, rollback and persisted environment state

mod common;

use common::{RecordingDeployer, ScriptedHealth};
use conveyor_engine::promotion::PromotionPhase;
use conveyor_engine::{
    EnvironmentState, HealthStatus, InMemoryStateStore, JsonFileStateStore, PromotionConfig,
    PromotionEngine, PromotionError, PromotionStatus, StateStore,
};

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn fast_checks() -> PromotionConfig {
    PromotionConfig::default().with_health_check_interval(Duration::from_millis(1))
}

async fn seeded_store(environment: &str, version: &str) -> Arc<InMemoryStateStore> {
    let store = Arc::new(InMemoryStateStore::new());
    let mut state = EnvironmentState::empty(environment);
    state.record_deployment(version, Utc::now());
    state.health = HealthStatus::Healthy;
    store.put(&state).await.unwrap();
    store
}

#[tokio::test]
async fn test_unhealthy_promotion_keeps_previous_version() {
    let store = seeded_store("staging", "v1").await;
    let deployer = Arc::new(RecordingDeployer::default());
    let health = Arc::new(ScriptedHealth::new(
        vec![
            HealthStatus::Unhealthy,
            HealthStatus::Unhealthy,
            HealthStatus::Unhealthy,
        ],
        HealthStatus::Healthy,
    ));
    let engine = PromotionEngine::new(deployer.clone(), health.clone(), store.clone())
        .with_config(fast_checks());

    let result = engine.promote("staging", "v2").await;

    assert_eq!(result.status, PromotionStatus::RolledBack);
    assert_eq!(
        result.reason,
        Some(PromotionError::HealthCheckFailed { attempts: 3 })
    );
    assert_eq!(result.health_check_attempts, 3);
    assert_eq!(result.restored_version.as_deref(), Some("v1"));
    assert_eq!(result.rollback_healthy, Some(true));
    assert_eq!(
        result.transitions,
        vec![
            PromotionPhase::Idle,
            PromotionPhase::Deploying,
            PromotionPhase::HealthChecking,
            PromotionPhase::RolledBack,
        ]
    );
    // Three checks for v2, one for the restored v1
    assert_eq!(health.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        deployer.log(),
        vec![
            "start staging v2",
            "end staging v2",
            "start staging v1",
            "end staging v1"
        ]
    );

    let state = store.get("staging").await.unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some("v1"));
    assert!(state.history.is_empty());
}

#[tokio::test]
async fn test_promotions_to_one_environment_are_serialized() {
    let store = Arc::new(InMemoryStateStore::new());
    let deployer = Arc::new(RecordingDeployer::with_delay(Duration::from_millis(50)));
    let engine = Arc::new(PromotionEngine::new(
        deployer.clone(),
        Arc::new(ScriptedHealth::always(HealthStatus::Healthy)),
        store.clone(),
    ));

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.promote("production", "v1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.promote("production", "v2").await })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert!(first.is_promoted());
    assert!(second.is_promoted());

    assert_eq!(
        deployer.log(),
        vec![
            "start production v1",
            "end production v1",
            "start production v2",
            "end production v2"
        ]
    );

    let state = store.get("production").await.unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some("v2"));
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].version, "v1");
}

#[tokio::test]
async fn test_different_environments_promote_concurrently() {
    let deployer = Arc::new(RecordingDeployer::with_delay(Duration::from_millis(50)));
    let engine = Arc::new(PromotionEngine::new(
        deployer.clone(),
        Arc::new(ScriptedHealth::always(HealthStatus::Healthy)),
        Arc::new(InMemoryStateStore::new()),
    ));

    let staging = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.promote("staging", "v1").await })
    };
    let qa = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.promote("qa", "v1").await })
    };
    staging.await.unwrap();
    qa.await.unwrap();

    // Both deployments started before either finished
    let log = deployer.log();
    assert!(log[0].starts_with("start"));
    assert!(log[1].starts_with("start"));
}

#[tokio::test]
async fn test_failed_deploy_rolls_back() {
    let store = seeded_store("staging", "v1").await;
    let deployer = Arc::new(RecordingDeployer {
        failing: vec!["v2".to_string()],
        ..Default::default()
    });
    let health = Arc::new(ScriptedHealth::always(HealthStatus::Healthy));
    let engine = PromotionEngine::new(deployer.clone(), health.clone(), store.clone());

    let result = engine.promote("staging", "v2").await;

    assert_eq!(result.status, PromotionStatus::RolledBack);
    assert_eq!(
        result.reason,
        Some(PromotionError::DeployFailed("v2 rejected".to_string()))
    );
    assert_eq!(result.health_check_attempts, 0);
    assert_eq!(result.restored_version.as_deref(), Some("v1"));
    // Only the restored version was checked
    assert_eq!(health.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_first_deployment_has_nothing_to_restore() {
    let store = Arc::new(InMemoryStateStore::new());
    let engine = PromotionEngine::new(
        Arc::new(RecordingDeployer::default()),
        Arc::new(ScriptedHealth::always(HealthStatus::Unhealthy)),
        store.clone(),
    )
    .with_config(fast_checks());

    let result = engine.promote("dev", "v1").await;

    assert_eq!(result.status, PromotionStatus::RolledBack);
    assert_eq!(result.restored_version, None);
    let state = store.get("dev").await.unwrap().unwrap();
    assert_eq!(state.current_version, None);
    assert_eq!(state.health, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_promote_through_stops_at_first_rollback() {
    let engine = PromotionEngine::new(
        Arc::new(RecordingDeployer::default()),
        Arc::new(ScriptedHealth::new(
            vec![
                HealthStatus::Healthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unhealthy,
            ],
            HealthStatus::Healthy,
        )),
        Arc::new(InMemoryStateStore::new()),
    )
    .with_config(fast_checks().with_health_check_attempts(2));

    let environments = vec![
        "staging".to_string(),
        "canary".to_string(),
        "production".to_string(),
    ];
    let results = engine.promote_through(&environments, "v7").await;

    assert_eq!(results.len(), 2);
    assert!(results[0].is_promoted());
    assert_eq!(results[1].environment, "canary");
    assert_eq!(results[1].status, PromotionStatus::RolledBack);
}

#[tokio::test]
async fn test_state_survives_restart_and_manual_rollback() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = PromotionEngine::new(
            Arc::new(RecordingDeployer::default()),
            Arc::new(ScriptedHealth::always(HealthStatus::Healthy)),
            Arc::new(JsonFileStateStore::new(dir.path())),
        );
        assert!(engine.promote("production", "v1").await.is_promoted());
        assert!(engine.promote("production", "v2").await.is_promoted());
    }

    let store = Arc::new(JsonFileStateStore::new(dir.path()));
    let deployer = Arc::new(RecordingDeployer::default());
    let engine = PromotionEngine::new(
        deployer.clone(),
        Arc::new(ScriptedHealth::always(HealthStatus::Healthy)),
        store.clone(),
    );

    let state = engine.state("production").await.unwrap();
    assert_eq!(state.current_version.as_deref(), Some("v2"));
    assert_eq!(state.history.len(), 1);

    let result = engine.rollback("production").await.unwrap();
    assert_eq!(result.status, PromotionStatus::RolledBack);
    assert_eq!(result.restored_version.as_deref(), Some("v1"));
    assert_eq!(deployer.log(), vec!["start production v1", "end production v1"]);

    let state = store.get("production").await.unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some("v1"));
    assert!(state.history.is_empty());

    assert_eq!(
        engine.rollback("production").await.unwrap_err(),
        PromotionError::NoRollbackTarget
    );
}
