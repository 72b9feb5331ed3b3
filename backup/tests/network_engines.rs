//! Round trips against live servers. Run with `cargo test -- --ignored` after
//! exporting `DBWARDEN_TEST_<ENGINE>_{HOST,PORT,USER,PASSWORD,DATABASE}`.

use backup::adapter::mongodb;
use backup::guard::StepGuard;
use backup::{
    ArtifactRef, BackupRequest, ConnectionSpec, Engine, ErrorKind, Orchestrator, OrchestratorConfig,
    RestoreRequest, Status, Step,
};
use serial_test::serial;
use std::env;

fn spec_from_env(engine: Engine) -> Option<ConnectionSpec> {
    spec_from_env_for(engine, None)
}

/// Like [`spec_from_env`], pointed at `database` when given.
fn spec_from_env_for(engine: Engine, database: Option<String>) -> Option<ConnectionSpec> {
    let prefix = format!("DBWARDEN_TEST_{}", engine.as_str().to_uppercase());
    let var = |key: &str| env::var(format!("{prefix}_{key}")).ok();
    let port = var("PORT")
        .and_then(|p| p.parse().ok())
        .unwrap_or(engine.default_port()?);
    ConnectionSpec::new(
        engine,
        var("HOST")?,
        port,
        var("USER")?,
        var("PASSWORD").unwrap_or_default(),
        database.or_else(|| var("DATABASE"))?,
    )
    .ok()
}

async fn round_trip(engine: Engine) {
    let Some(spec) = spec_from_env(engine) else {
        eprintln!("skipping {engine}: connection variables not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(OrchestratorConfig::new(
        dir.path().join("locks"),
        dir.path().join("work"),
    ));

    let backup = orch
        .backup(BackupRequest {
            spec: spec.clone(),
            output_path: None,
            compress: true,
            cloud_target: None,
        })
        .await;
    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);
    let Some(ArtifactRef::Local(archive)) = backup.artifact_ref else {
        panic!("expected a local archive");
    };

    // The source database is not empty, so an unforced restore must refuse
    let refused = orch
        .restore(RestoreRequest {
            spec: spec.clone(),
            artifact_source: Some(archive.clone()),
            cloud_source: None,
            force: false,
        })
        .await;
    let error = refused.error.expect("restore over live data should fail");
    assert_eq!(error.kind, ErrorKind::TargetNotEmpty);

    let forced = orch
        .restore(RestoreRequest {
            spec,
            artifact_source: Some(archive),
            cloud_source: None,
            force: true,
        })
        .await;
    assert_eq!(forced.status, Status::Success, "{:?}", forced.error);
    assert_eq!(
        forced.step_names(),
        vec![Step::Connect, Step::Decompress, Step::Restore]
    );
}

#[tokio::test]
#[ignore]
#[serial]
async fn postgres_round_trip() {
    round_trip(Engine::PostgreSql).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn mysql_round_trip() {
    round_trip(Engine::MySql).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn mongodb_round_trip() {
    round_trip(Engine::MongoDb).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn mongodb_restores_into_a_differently_named_database() {
    let Some(spec) = spec_from_env(Engine::MongoDb) else {
        return;
    };
    let target_db = env::var("DBWARDEN_TEST_MONGODB_RESTORE_DATABASE")
        .unwrap_or_else(|_| format!("{}_restored", spec.database()));
    let target = spec_from_env_for(Engine::MongoDb, Some(target_db)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(OrchestratorConfig::new(
        dir.path().join("locks"),
        dir.path().join("work"),
    ));

    let backup = orch
        .backup(BackupRequest {
            spec: spec.clone(),
            output_path: None,
            compress: true,
            cloud_target: None,
        })
        .await;
    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);
    let Some(ArtifactRef::Local(archive)) = backup.artifact_ref else {
        panic!("expected a local archive");
    };

    let restored = orch
        .restore(RestoreRequest {
            spec: target.clone(),
            artifact_source: Some(archive),
            cloud_source: None,
            force: true,
        })
        .await;
    assert_eq!(restored.status, Status::Success, "{:?}", restored.error);

    let empty = mongodb::is_empty(&target, &StepGuard::unbounded("verify"))
        .await
        .unwrap();
    assert!(!empty, "collections should land in {}", target.database());
}

#[tokio::test]
#[ignore]
#[serial]
async fn wrong_password_is_an_authentication_error() {
    let Some(spec) = spec_from_env(Engine::PostgreSql) else {
        return;
    };
    let spec = ConnectionSpec::new(
        Engine::PostgreSql,
        spec.host(),
        spec.port(),
        spec.user(),
        "definitely-not-the-password",
        spec.database(),
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(OrchestratorConfig::new(dir.path(), dir.path()));

    let result = orch
        .backup(BackupRequest {
            spec,
            output_path: None,
            compress: false,
            cloud_target: None,
        })
        .await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.step_names(), vec![Step::Connect]);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Authentication);
}
