//! Step sequencing, retries and result assembly for backup and restore runs.

use crate::adapter::{Adapter, AdapterOptions};
use crate::checksum::{self, sniff_engine};
use crate::codec::ArtifactCodec;
use crate::events::{EventObserver, LogObserver, OperationEvent};
use crate::guard::StepGuard;
use crate::lock::OperationLock;
use crate::probe::Purpose;
use crate::uploader::CloudUploader;
use crate::{
    default_artifact_name, ArtifactRef, BackupError, CloudRef, ConnectionSpec, Engine,
    Idempotence, Operation, OperationError, OperationResult, Result, Status, Step, StepOutcome,
    StepRecord,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bounded exponential backoff for idempotent steps.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Keep raw dumps next to their archives and restore staging files
    pub keep_intermediate: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lock_dir: PathBuf,
    /// Default output directory and parent of restore staging directories
    pub work_dir: PathBuf,
    pub step_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub compression_level: u32,
    pub quiesce_command: Option<String>,
}

impl OrchestratorConfig {
    pub fn new(lock_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            work_dir: work_dir.into(),
            step_timeout: Some(Duration::from_secs(3600)),
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            compression_level: 6,
            quiesce_command: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub spec: ConnectionSpec,
    /// Where the dump goes; a timestamped name in the work dir when absent
    pub output_path: Option<PathBuf>,
    pub compress: bool,
    pub cloud_target: Option<CloudRef>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub spec: ConnectionSpec,
    pub artifact_source: Option<PathBuf>,
    pub cloud_source: Option<CloudRef>,
    pub force: bool,
}

/// Bookkeeping for one run.
struct Run {
    id: Uuid,
    operation: Operation,
    engine: Engine,
    database: String,
    started: Instant,
    steps: Vec<StepRecord>,
    warnings: Vec<String>,
    failed_step: Option<Step>,
    /// A one-shot step has succeeded, so later failures are partial
    committed: bool,
    artifact_ref: Option<ArtifactRef>,
}

impl Run {
    fn new(operation: Operation, spec: &ConnectionSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            engine: spec.engine(),
            database: spec.database().to_string(),
            started: Instant::now(),
            steps: Vec::new(),
            warnings: Vec::new(),
            failed_step: None,
            committed: false,
            artifact_ref: None,
        }
    }
}

enum RestoreSource<'a> {
    Local(&'a Path),
    Remote(&'a CloudRef, &'a dyn CloudUploader),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    codec: ArtifactCodec,
    uploader: Option<Arc<dyn CloudUploader>>,
    observer: Arc<dyn EventObserver>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            codec: ArtifactCodec::new(config.compression_level),
            config,
            uploader: None,
            observer: Arc::new(LogObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn CloudUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Cancelling this token stops in-flight steps and fails the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn adapter(&self, engine: Engine) -> Adapter {
        let options = AdapterOptions {
            quiesce_command: self.config.quiesce_command.clone(),
        };
        Adapter::for_engine(engine, &options)
    }

    /// Connect → dump → compress? → upload?
    pub async fn backup(&self, request: BackupRequest) -> OperationResult {
        let mut run = Run::new(Operation::Backup, &request.spec);
        info!("Starting backup {} of {}", run.id, request.spec);
        let outcome = self.run_backup(&mut run, &request).await;
        self.finish(run, outcome)
    }

    /// Download? → decompress? → restore
    pub async fn restore(&self, request: RestoreRequest) -> OperationResult {
        let mut run = Run::new(Operation::Restore, &request.spec);
        info!("Starting restore {} into {}", run.id, request.spec);
        let outcome = self.run_restore(&mut run, &request).await;
        self.finish(run, outcome)
    }

    /// Runs one step, retrying idempotent ones on retryable errors, and records
    /// the attempt on the run either way.
    async fn step<T, F, Fut>(&self, run: &mut Run, step: Step, mut action: F) -> Result<T>
    where
        F: FnMut(StepGuard) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started_at = Utc::now();
        let max_attempts = match step.idempotence() {
            Idempotence::Idempotent => self.config.retry.max_attempts.max(1),
            Idempotence::OneShot | Idempotence::Destructive => 1,
        };
        debug!("Entering step {step}");

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let guard = StepGuard::new(step.as_str(), self.config.step_timeout, self.cancel.clone());
            let result = match guard.check() {
                Ok(()) => action(guard).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let delay = self.config.retry.delay_after(attempts);
                    warn!("Step {step} attempt {attempts}/{max_attempts} failed: {e}; retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            break Err(BackupError::Cancelled(format!("{step} (waiting to retry)")));
                        }
                    }
                }
                other => break other,
            }
        };

        let outcome = match &result {
            Ok(_) => {
                info!("Step {step} succeeded");
                StepOutcome::Succeeded
            }
            Err(e) => {
                error!("Step {step} failed after {attempts} attempt(s): {e}");
                run.failed_step = Some(step);
                StepOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        run.steps.push(StepRecord {
            step,
            started_at,
            finished_at: Utc::now(),
            attempts,
            outcome,
        });
        result
    }

    async fn run_backup(&self, run: &mut Run, request: &BackupRequest) -> Result<()> {
        let spec = &request.spec;
        let uploader = match (&request.cloud_target, &self.uploader) {
            (Some(target), Some(uploader)) => Some((target, uploader.as_ref())),
            (Some(target), None) => {
                return Err(BackupError::ConfigValidation(format!(
                    "upload to {target} requested but no object storage is configured"
                )))
            }
            (None, _) => None,
        };

        let _lock = OperationLock::acquire_for(&self.config.lock_dir, spec)?;
        let output = match &request.output_path {
            Some(path) => path.clone(),
            None => self
                .config
                .work_dir
                .join(default_artifact_name(spec, Utc::now())),
        };
        let output = output.as_path();
        let adapter = &self.adapter(spec.engine());

        self.step(run, Step::Connect, move |guard| async move {
            adapter.probe(spec, Purpose::Backup, &guard).await
        })
        .await?;

        let dumped = self
            .step(run, Step::Dump, move |guard| async move {
                adapter.dump(spec, output, &guard).await
            })
            .await?;
        run.committed = true;
        run.warnings.extend(dumped.warnings);
        let raw = dumped.artifact;
        run.artifact_ref = Some(ArtifactRef::Local(raw.path.clone()));

        let mut last = raw.clone();
        if request.compress {
            let (codec, input) = (&self.codec, &raw);
            last = self
                .step(run, Step::Compress, move |guard| async move {
                    codec.compress(input, &guard).await
                })
                .await?;
            run.artifact_ref = Some(ArtifactRef::Local(last.path.clone()));
        }

        if let Some((target, uploader)) = uploader {
            let artifact = &last;
            let remote = self
                .step(run, Step::Upload, move |guard| async move {
                    guard.run(uploader.upload(artifact, target)).await
                })
                .await?;
            run.artifact_ref = Some(ArtifactRef::Remote(remote));
        }

        if request.compress && !self.config.retention.keep_intermediate {
            remove_intermediate(&raw.path, run).await;
        }
        Ok(())
    }

    fn restore_source<'a>(&'a self, request: &'a RestoreRequest) -> Result<RestoreSource<'a>> {
        match (&request.artifact_source, &request.cloud_source) {
            (Some(_), Some(_)) => Err(BackupError::ConfigValidation(
                "give either a local artifact or a cloud source, not both".to_string(),
            )),
            (None, None) => Err(BackupError::ConfigValidation(
                "restore needs a local artifact or a cloud source".to_string(),
            )),
            (Some(path), None) => {
                if !path.exists() {
                    return Err(BackupError::NotFound(format!(
                        "artifact {} does not exist",
                        path.display()
                    )));
                }
                Ok(RestoreSource::Local(path))
            }
            (None, Some(remote)) => {
                if remote.key.as_deref().map_or(true, str::is_empty) {
                    return Err(BackupError::ConfigValidation(format!(
                        "{remote} does not name an object to restore"
                    )));
                }
                let uploader = self.uploader.as_deref().ok_or_else(|| {
                    BackupError::ConfigValidation(format!(
                        "restore from {remote} requested but no object storage is configured"
                    ))
                })?;
                Ok(RestoreSource::Remote(remote, uploader))
            }
        }
    }

    async fn run_restore(&self, run: &mut Run, request: &RestoreRequest) -> Result<()> {
        let source = self.restore_source(request)?;
        let _lock = OperationLock::acquire_for(&self.config.lock_dir, &request.spec)?;
        let staging = self
            .config
            .work_dir
            .join(format!("dbwarden-restore-{}", run.id));

        let result = self.restore_steps(run, request, source, &staging).await;

        if staging.exists() {
            if result.is_err() {
                warn!("Keeping restore staging files in {}", staging.display());
            } else if !self.config.retention.keep_intermediate {
                if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                    run.warnings.push(format!(
                        "could not remove staging directory {}: {e}",
                        staging.display()
                    ));
                }
            }
        }
        result
    }

    async fn restore_steps(
        &self,
        run: &mut Run,
        request: &RestoreRequest,
        source: RestoreSource<'_>,
        staging: &Path,
    ) -> Result<()> {
        let spec = &request.spec;
        let adapter = &self.adapter(spec.engine());

        self.step(run, Step::Connect, move |guard| async move {
            adapter.probe(spec, Purpose::Restore, &guard).await
        })
        .await?;

        // (path, artifact when already described, compressed)
        let (path, described, compressed) = match source {
            RestoreSource::Local(path) => {
                run.artifact_ref = Some(ArtifactRef::Local(path.to_path_buf()));
                (path.to_path_buf(), None, checksum::is_compressed(path)?)
            }
            RestoreSource::Remote(remote, uploader) => {
                run.artifact_ref = Some(ArtifactRef::Remote(remote.clone()));
                let name = remote
                    .key
                    .as_deref()
                    .and_then(|k| k.rsplit('/').find(|s| !s.is_empty()))
                    .unwrap_or("artifact");
                let local = staging.join(name);
                let local = local.as_path();
                let downloaded = self
                    .step(run, Step::Download, move |guard| async move {
                        guard.run(uploader.download(remote, local, &guard)).await
                    })
                    .await?;
                let compressed = downloaded.compressed;
                (downloaded.path.clone(), Some(downloaded), compressed)
            }
        };

        // Engine recorded alongside a downloaded object, if any
        let recorded_engine = described.as_ref().map(|a| a.engine);
        let (restore_path, engine_checked) = if compressed {
            let (codec, archive_path, described) = (&self.codec, path.as_path(), described.as_ref());
            let extracted = self
                .step(run, Step::Decompress, move |guard| async move {
                    let header = ArtifactCodec::read_header(archive_path)?;
                    if header.engine != spec.engine() {
                        return Err(BackupError::EngineMismatch {
                            expected: spec.engine(),
                            found: header.engine,
                        });
                    }
                    let archive = match described {
                        Some(artifact) => artifact.clone(),
                        None => {
                            checksum::describe(archive_path.to_path_buf(), header.engine, true, &guard)
                                .await?
                        }
                    };
                    codec.decompress(&archive, staging, &guard).await
                })
                .await?;
            (extracted.path, true)
        } else {
            (path, false)
        };

        let (restore_path, force) = (restore_path.as_path(), request.force);
        let warning = self
            .step(run, Step::Restore, move |guard| async move {
                let warning = match (engine_checked, recorded_engine) {
                    (true, _) => None,
                    (false, Some(found)) if found != spec.engine() => {
                        return Err(BackupError::EngineMismatch {
                            expected: spec.engine(),
                            found,
                        });
                    }
                    (false, Some(_)) => None,
                    (false, None) => check_sniffed_engine(restore_path, spec.engine())?,
                };
                adapter.restore(spec, restore_path, force, &guard).await?;
                Ok(warning)
            })
            .await?;
        run.warnings.extend(warning);
        Ok(())
    }

    fn finish(&self, run: Run, outcome: Result<()>) -> OperationResult {
        let (status, error) = match outcome {
            Ok(()) => (Status::Success, None),
            Err(e) => {
                let status = if run.committed {
                    Status::Partial
                } else {
                    Status::Failed
                };
                (status, Some(OperationError::new(&e, run.failed_step, run.engine)))
            }
        };
        let duration_ms = run.started.elapsed().as_millis() as u64;
        match (&status, &error) {
            (Status::Success, _) => info!("{} {} succeeded in {duration_ms} ms", run.operation, run.id),
            (_, Some(e)) => error!("{} {} {status}: {}", run.operation, run.id, e.message),
            (_, None) => {}
        }

        let event = OperationEvent {
            id: run.id,
            operation: run.operation,
            engine: run.engine,
            database: run.database,
            status,
            duration_ms,
            error: error.clone(),
            artifact: run.artifact_ref.clone(),
        };
        self.observer.on_event(&event);

        OperationResult {
            operation: run.operation,
            status,
            artifact_ref: run.artifact_ref,
            error,
            steps_completed: run.steps,
            warnings: run.warnings,
        }
    }
}

/// Engine check for an uncompressed artifact. Returns a warning when the
/// engine cannot be recognised.
fn check_sniffed_engine(path: &Path, expected: Engine) -> Result<Option<String>> {
    match sniff_engine(path)? {
        Some(found) if found != expected => Err(BackupError::EngineMismatch { expected, found }),
        Some(_) => Ok(None),
        None => {
            let warning = format!(
                "could not tell which engine produced {}; engine check skipped",
                path.display()
            );
            warn!("{warning}");
            Ok(Some(warning))
        }
    }
}

async fn remove_intermediate(path: &Path, run: &mut Run) {
    let res = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Ok(()) => debug!("Removed intermediate {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => run.warnings.push(format!(
            "could not remove intermediate {}: {e}",
            path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn orchestrator(dir: &Path) -> Orchestrator {
        let mut config = OrchestratorConfig::new(dir.join("locks"), dir.join("work"));
        config.retry.base_delay = Duration::from_millis(1);
        Orchestrator::new(config)
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn idempotent_steps_retry_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let spec = ConnectionSpec::sqlite("/data/app.db").unwrap();
        let mut run = Run::new(Operation::Backup, &spec);
        let calls = AtomicU32::new(0);

        let value = orch
            .step(&mut run, Step::Upload, |_guard| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BackupError::StorageUnavailable("503".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].attempts, 3);
        assert!(run.steps[0].succeeded());
    }

    #[tokio::test]
    async fn one_shot_and_non_retryable_failures_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let spec = ConnectionSpec::sqlite("/data/app.db").unwrap();
        let mut run = Run::new(Operation::Backup, &spec);
        let calls = AtomicU32::new(0);

        let err = orch
            .step(&mut run, Step::Dump, |_guard| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackupError::StorageUnavailable("503".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = orch
            .step(&mut run, Step::Upload, |_guard| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackupError::Permission("403".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Permission(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.failed_step, Some(Step::Upload));
    }

    #[tokio::test]
    async fn cancelled_run_fails_the_next_step_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        orch.cancellation_token().cancel();
        let spec = ConnectionSpec::sqlite("/data/app.db").unwrap();
        let mut run = Run::new(Operation::Backup, &spec);

        let err = orch
            .step(&mut run, Step::Connect, |_guard| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
        assert_eq!(run.steps[0].attempts, 1);
    }

    #[test]
    fn unknown_artifacts_only_warn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        std::fs::write(&path, b"mystery bytes").unwrap();
        let warning = check_sniffed_engine(&path, Engine::PostgreSql).unwrap();
        assert!(warning.is_some());

        std::fs::write(&path, b"PGDMP\x01").unwrap();
        let err = check_sniffed_engine(&path, Engine::MySql).unwrap_err();
        assert!(matches!(
            err,
            BackupError::EngineMismatch {
                expected: Engine::MySql,
                found: Engine::PostgreSql
            }
        ));
    }
}
