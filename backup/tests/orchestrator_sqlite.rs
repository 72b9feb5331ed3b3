use async_trait::async_trait;
use backup::checksum::checksum_path;
use backup::events::{EventObserver, OperationEvent};
use backup::guard::StepGuard;
use backup::lock::OperationLock;
use backup::uploader::CloudUploader;
use backup::{
    Artifact, ArtifactRef, BackupError, BackupRequest, CloudRef, ConnectionSpec, Engine, ErrorKind,
    Orchestrator, OrchestratorConfig, RestoreRequest, Status, Step,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::StorageProviderType;
use tempfile::TempDir;

fn sqlite_bytes(tag: &str) -> Vec<u8> {
    let mut bytes = b"SQLite format 3\0".to_vec();
    bytes.extend(std::iter::repeat(tag.as_bytes()).take(512).flatten());
    bytes
}

fn setup() -> (TempDir, PathBuf, OrchestratorConfig) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    fs::write(&db, sqlite_bytes("orders")).unwrap();
    let mut config = OrchestratorConfig::new(dir.path().join("locks"), dir.path().join("work"));
    config.retry.base_delay = Duration::from_millis(1);
    (dir, db, config)
}

fn backup_request(db: &Path, output: PathBuf, compress: bool) -> BackupRequest {
    BackupRequest {
        spec: ConnectionSpec::sqlite(db.to_string_lossy()).unwrap(),
        output_path: Some(output),
        compress,
        cloud_target: None,
    }
}

fn restore_request(target: &Path, source: PathBuf, force: bool) -> RestoreRequest {
    RestoreRequest {
        spec: ConnectionSpec::sqlite(target.to_string_lossy()).unwrap(),
        artifact_source: Some(source),
        cloud_source: None,
        force,
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<OperationEvent>>,
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &OperationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Object store double keyed by `bucket/key`.
#[derive(Default)]
struct MemoryUploader {
    objects: Mutex<HashMap<String, (Vec<u8>, Artifact)>>,
}

#[async_trait]
impl CloudUploader for MemoryUploader {
    async fn upload(&self, artifact: &Artifact, target: &CloudRef) -> backup::Result<CloudRef> {
        let name = artifact.path.file_name().unwrap().to_string_lossy().into_owned();
        let key = target.key.clone().unwrap_or(name);
        let bytes = fs::read(&artifact.path)?;
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{}/{key}", target.bucket), (bytes, artifact.clone()));
        Ok(CloudRef::new(target.provider, target.bucket.clone(), Some(key)))
    }

    async fn download(
        &self,
        remote: &CloudRef,
        local_path: &Path,
        _guard: &StepGuard,
    ) -> backup::Result<Artifact> {
        let id = format!("{}/{}", remote.bucket, remote.key.as_deref().unwrap_or_default());
        let (bytes, artifact) = self
            .objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(id.clone()))?;
        fs::create_dir_all(local_path.parent().unwrap())?;
        fs::write(local_path, bytes)?;
        Ok(Artifact {
            path: local_path.to_path_buf(),
            ..artifact
        })
    }
}

#[tokio::test]
async fn compressed_backup_reports_each_step_and_the_archive() {
    let (dir, db, config) = setup();
    let observer = Arc::new(RecordingObserver::default());
    let orch = Orchestrator::new(config).with_observer(observer.clone());
    let output = dir.path().join("out").join("app.bak");

    let result = orch.backup(backup_request(&db, output.clone(), true)).await;

    assert_eq!(result.status, Status::Success, "{:?}", result.error);
    assert_eq!(result.step_names(), vec![Step::Connect, Step::Dump, Step::Compress]);
    assert_eq!(
        result.artifact_ref,
        Some(ArtifactRef::Local(dir.path().join("out").join("app.bak.archive")))
    );
    assert!(result.error.is_none());
    assert!(result.steps_completed.iter().all(|s| s.succeeded() && s.attempts == 1));
    // The raw dump is an intermediate and is removed once the archive exists
    assert!(!output.exists());
    assert!(!dir.path().join("out").join("app.bak.archive.partial").exists());

    let events = observer.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, Status::Success);
    assert_eq!(events[0].engine, Engine::Sqlite);
}

#[tokio::test]
async fn keep_intermediate_retains_the_raw_dump() {
    let (dir, db, mut config) = setup();
    config.retention.keep_intermediate = true;
    let orch = Orchestrator::new(config);
    let output = dir.path().join("app.bak");

    let result = orch.backup(backup_request(&db, output.clone(), true)).await;

    assert_eq!(result.status, Status::Success, "{:?}", result.error);
    assert_eq!(fs::read(&output).unwrap(), fs::read(&db).unwrap());
}

#[tokio::test]
async fn backup_then_restore_reproduces_the_database() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let output = dir.path().join("app.bak");

    let backup = orch.backup(backup_request(&db, output, true)).await;
    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);
    let Some(ArtifactRef::Local(archive)) = backup.artifact_ref else {
        panic!("expected a local artifact");
    };

    let target = dir.path().join("restored.db");
    let restore = orch.restore(restore_request(&target, archive.clone(), false)).await;

    assert_eq!(restore.status, Status::Success, "{:?}", restore.error);
    assert_eq!(
        restore.step_names(),
        vec![Step::Connect, Step::Decompress, Step::Restore]
    );
    assert_eq!(restore.artifact_ref, Some(ArtifactRef::Local(archive)));
    let guard = StepGuard::unbounded("verify");
    assert_eq!(
        checksum_path(&target, &guard).unwrap(),
        checksum_path(&db, &guard).unwrap()
    );
    // Staging is cleaned up after a successful restore
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("work"))
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn uncompressed_artifacts_restore_directly() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let output = dir.path().join("app.bak");

    let backup = orch.backup(backup_request(&db, output.clone(), false)).await;
    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);
    assert_eq!(backup.step_names(), vec![Step::Connect, Step::Dump]);
    assert_eq!(backup.artifact_ref, Some(ArtifactRef::Local(output.clone())));

    let target = dir.path().join("copy.db");
    let restore = orch.restore(restore_request(&target, output, false)).await;
    assert_eq!(restore.status, Status::Success, "{:?}", restore.error);
    assert_eq!(restore.step_names(), vec![Step::Connect, Step::Restore]);
    assert!(restore.warnings.is_empty());
    assert_eq!(fs::read(&target).unwrap(), fs::read(&db).unwrap());
}

#[tokio::test]
async fn compress_failure_after_dump_is_partial() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let output = dir.path().join("app.bak");
    // A non-empty directory where the archive must land makes the final rename fail
    let blocker = dir.path().join("app.bak.archive");
    fs::create_dir_all(blocker.join("occupied")).unwrap();

    let result = orch.backup(backup_request(&db, output.clone(), true)).await;

    assert_eq!(result.status, Status::Partial);
    assert_eq!(result.artifact_ref, Some(ArtifactRef::Local(output.clone())));
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step, Some(Step::Compress));
    assert_eq!(result.step_names(), vec![Step::Connect, Step::Dump, Step::Compress]);
    assert!(!result.steps_completed[2].succeeded());
    // The uncompressed dump survives for the operator
    assert_eq!(fs::read(&output).unwrap(), fs::read(&db).unwrap());
}

#[tokio::test]
async fn non_empty_target_is_refused_without_force() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let output = dir.path().join("app.bak");
    let backup = orch.backup(backup_request(&db, output.clone(), false)).await;
    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);

    let target = dir.path().join("live.db");
    let live = sqlite_bytes("customers");
    fs::write(&target, &live).unwrap();

    let refused = orch.restore(restore_request(&target, output.clone(), false)).await;
    assert_eq!(refused.status, Status::Failed);
    let error = refused.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::TargetNotEmpty);
    assert_eq!(error.step, Some(Step::Restore));
    assert_eq!(fs::read(&target).unwrap(), live);

    let forced = orch.restore(restore_request(&target, output, true)).await;
    assert_eq!(forced.status, Status::Success, "{:?}", forced.error);
    assert_eq!(fs::read(&target).unwrap(), fs::read(&db).unwrap());
}

#[tokio::test]
async fn concurrent_runs_on_one_database_are_rejected() {
    let (dir, db, mut config) = setup();
    config.quiesce_command = Some("sleep 0.5".to_string());
    let orch = Orchestrator::new(config);

    let first = orch.backup(backup_request(&db, dir.path().join("one.bak"), false));
    let second = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        orch.backup(backup_request(&db, dir.path().join("two.bak"), false))
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.status, Status::Success, "{:?}", first.error);
    assert_eq!(second.status, Status::Failed);
    assert_eq!(second.error.unwrap().kind, ErrorKind::OperationInProgress);
    assert!(second.steps_completed.is_empty());
}

#[tokio::test]
async fn held_lock_blocks_restore_too() {
    let (dir, db, config) = setup();
    let spec = ConnectionSpec::sqlite(db.to_string_lossy()).unwrap();
    let _held = OperationLock::acquire_for(&config.lock_dir, &spec).unwrap();
    let orch = Orchestrator::new(config);

    let source = dir.path().join("app.bak");
    fs::write(&source, sqlite_bytes("orders")).unwrap();
    let result = orch.restore(restore_request(&db, source, true)).await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::OperationInProgress);
}

#[tokio::test]
async fn cloud_round_trip_through_an_uploader() {
    let (dir, db, config) = setup();
    let uploader = Arc::new(MemoryUploader::default());
    let orch = Orchestrator::new(config).with_uploader(uploader.clone());

    let mut request = backup_request(&db, dir.path().join("app.bak"), true);
    request.cloud_target = Some(CloudRef::new(
        StorageProviderType::S3,
        "backups",
        Some("nightly/app.bak.archive".to_string()),
    ));
    let backup = orch.backup(request).await;

    assert_eq!(backup.status, Status::Success, "{:?}", backup.error);
    assert_eq!(
        backup.step_names(),
        vec![Step::Connect, Step::Dump, Step::Compress, Step::Upload]
    );
    let Some(ArtifactRef::Remote(remote)) = backup.artifact_ref else {
        panic!("expected a remote artifact");
    };
    assert_eq!(remote.to_string(), "s3://backups/nightly/app.bak.archive");

    let target = dir.path().join("from-cloud.db");
    let restore = orch
        .restore(RestoreRequest {
            spec: ConnectionSpec::sqlite(target.to_string_lossy()).unwrap(),
            artifact_source: None,
            cloud_source: Some(remote.clone()),
            force: false,
        })
        .await;

    assert_eq!(restore.status, Status::Success, "{:?}", restore.error);
    assert_eq!(
        restore.step_names(),
        vec![Step::Connect, Step::Download, Step::Decompress, Step::Restore]
    );
    assert_eq!(restore.artifact_ref, Some(ArtifactRef::Remote(remote)));
    assert_eq!(fs::read(&target).unwrap(), fs::read(&db).unwrap());
}

#[tokio::test]
async fn cloud_target_without_storage_fails_before_any_step() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let mut request = backup_request(&db, dir.path().join("app.bak"), false);
    request.cloud_target = Some(CloudRef::new(StorageProviderType::Gcs, "backups", None));

    let result = orch.backup(request).await;

    assert_eq!(result.status, Status::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ConfigValidation);
    assert_eq!(error.step, None);
    assert!(result.steps_completed.is_empty());
    assert!(!dir.path().join("app.bak").exists());
}

#[tokio::test]
async fn restore_needs_exactly_one_source() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);

    let neither = orch
        .restore(RestoreRequest {
            spec: ConnectionSpec::sqlite(db.to_string_lossy()).unwrap(),
            artifact_source: None,
            cloud_source: None,
            force: true,
        })
        .await;
    assert_eq!(neither.error.unwrap().kind, ErrorKind::ConfigValidation);

    let missing = orch
        .restore(restore_request(&db, dir.path().join("nope.bak"), true))
        .await;
    assert_eq!(missing.status, Status::Failed);
    assert_eq!(missing.error.unwrap().kind, ErrorKind::NotFound);
    assert!(missing.steps_completed.is_empty());
}

#[tokio::test]
async fn archive_from_another_engine_is_rejected() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    let backup = orch
        .backup(backup_request(&db, dir.path().join("app.bak"), true))
        .await;
    let Some(ArtifactRef::Local(archive)) = backup.artifact_ref else {
        panic!("expected a local artifact");
    };

    // Connect for a network engine fails first, so check the header directly
    let header = backup::codec::ArtifactCodec::read_header(&archive).unwrap();
    assert_eq!(header.engine, Engine::Sqlite);

    // A plain dump sniffed as PostgreSQL cannot be loaded into SQLite
    let pg_dump = dir.path().join("orders.dump");
    fs::write(&pg_dump, b"PGDMP\x01\x0e\x00").unwrap();
    let target = dir.path().join("target.db");
    let result = orch.restore(restore_request(&target, pg_dump, false)).await;

    assert_eq!(result.status, Status::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EngineMismatch);
    assert_eq!(error.step, Some(Step::Restore));
    assert!(!target.exists());
}

#[tokio::test]
async fn unrecognised_dump_restores_with_a_warning() {
    let (dir, _db, config) = setup();
    let orch = Orchestrator::new(config);
    let source = dir.path().join("blob.bin");
    fs::write(&source, b"not a known dump format").unwrap();
    let target = dir.path().join("target.db");

    let result = orch.restore(restore_request(&target, source, false)).await;

    assert_eq!(result.status, Status::Success, "{:?}", result.error);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("engine check skipped"));
}

#[tokio::test]
async fn missing_database_fails_at_connect() {
    let (dir, _db, config) = setup();
    let orch = Orchestrator::new(config);
    let absent = dir.path().join("absent.db");

    let result = orch
        .backup(backup_request(&absent, dir.path().join("x.bak"), true))
        .await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.step_names(), vec![Step::Connect]);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Unreachable);
    assert_eq!(error.step, Some(Step::Connect));
    assert!(result.artifact_ref.is_none());
}

#[tokio::test]
async fn cancelled_orchestrator_stops_before_connect() {
    let (dir, db, config) = setup();
    let orch = Orchestrator::new(config);
    orch.cancellation_token().cancel();

    let result = orch
        .backup(backup_request(&db, dir.path().join("app.bak"), false))
        .await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(!dir.path().join("app.bak").exists());
}

#[tokio::test]
async fn downloaded_artifact_from_another_engine_is_rejected() {
    let (dir, _db, config) = setup();
    let uploader = Arc::new(MemoryUploader::default());
    let body = b"INSERT INTO orders VALUES (1);\n".to_vec();
    let recorded = Artifact {
        path: dir.path().join("shop.sql"),
        engine: Engine::MySql,
        created_at: chrono::Utc::now(),
        size_bytes: body.len() as u64,
        compressed: false,
        checksum: String::new(),
    };
    uploader
        .objects
        .lock()
        .unwrap()
        .insert("backups/nightly/shop.sql".to_string(), (body, recorded));
    let orch = Orchestrator::new(config).with_uploader(uploader);
    let target = dir.path().join("target.db");

    let result = orch
        .restore(RestoreRequest {
            spec: ConnectionSpec::sqlite(target.to_string_lossy()).unwrap(),
            artifact_source: None,
            cloud_source: Some(CloudRef::new(
                StorageProviderType::S3,
                "backups",
                Some("nightly/shop.sql".to_string()),
            )),
            force: false,
        })
        .await;

    assert_eq!(result.status, Status::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EngineMismatch);
    assert_eq!(error.step, Some(Step::Restore));
    assert!(result.warnings.is_empty());
    assert!(!target.exists());
}
