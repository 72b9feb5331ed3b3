//! Engine adapters: probe, dump, restore and emptiness check for each backend.
//!
//! [`Adapter`] is a closed set selected by the engine tag; every operation is a
//! `match` over the variants.

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::checksum;
use crate::guard::StepGuard;
use crate::probe::Purpose;
use crate::wrapper::{run_supervised, ProcessError};
use crate::{with_suffix, Artifact, BackupError, ConnectionSpec, Engine, Result};
use log::{info, warn};
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    /// Shell command run before a SQLite copy, e.g. to pause writers
    pub quiesce_command: Option<String>,
}

/// A freshly dumped artifact and any consistency concerns raised on the way.
#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub artifact: Artifact,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Adapter {
    MySql,
    Postgres,
    MongoDb,
    Sqlite { quiesce_command: Option<String> },
}

impl Adapter {
    pub fn for_engine(engine: Engine, options: &AdapterOptions) -> Self {
        match engine {
            Engine::MySql => Adapter::MySql,
            Engine::PostgreSql => Adapter::Postgres,
            Engine::MongoDb => Adapter::MongoDb,
            Engine::Sqlite => Adapter::Sqlite {
                quiesce_command: options.quiesce_command.clone(),
            },
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            Adapter::MySql => Engine::MySql,
            Adapter::Postgres => Engine::PostgreSql,
            Adapter::MongoDb => Engine::MongoDb,
            Adapter::Sqlite { .. } => Engine::Sqlite,
        }
    }

    fn check_spec(&self, spec: &ConnectionSpec) -> Result<()> {
        if spec.engine() != self.engine() {
            return Err(BackupError::ConfigValidation(format!(
                "{} adapter cannot serve a {} connection",
                self.engine(),
                spec.engine()
            )));
        }
        Ok(())
    }

    /// Verifies reachability and credentials. The connection is not kept.
    pub async fn probe(&self, spec: &ConnectionSpec, purpose: Purpose, guard: &StepGuard) -> Result<()> {
        self.check_spec(spec)?;
        match self {
            Adapter::MySql => mysql::probe(spec, guard).await,
            Adapter::Postgres => postgres::probe(spec, guard).await,
            Adapter::MongoDb => mongodb::probe(spec, guard).await,
            Adapter::Sqlite { .. } => sqlite::probe(spec, purpose).await,
        }
    }

    pub async fn dump(&self, spec: &ConnectionSpec, output: &Path, guard: &StepGuard) -> Result<DumpOutcome> {
        self.check_spec(spec)?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!("Dumping {spec} to {}", output.display());
        let outcome = match self {
            Adapter::MySql => DumpOutcome::clean(mysql::dump(spec, output, guard).await?),
            Adapter::Postgres => DumpOutcome::clean(postgres::dump(spec, output, guard).await?),
            Adapter::MongoDb => DumpOutcome::clean(mongodb::dump(spec, output, guard).await?),
            Adapter::Sqlite { quiesce_command } => {
                sqlite::dump(spec, output, quiesce_command.as_deref(), guard).await?
            }
        };
        for warning in &outcome.warnings {
            warn!("{warning}");
        }
        info!(
            "Dump of {spec} complete: {} ({} bytes)",
            outcome.artifact.path.display(),
            outcome.artifact.size_bytes
        );
        Ok(outcome)
    }

    /// Whether the target holds no user data.
    pub async fn is_empty(&self, spec: &ConnectionSpec, guard: &StepGuard) -> Result<bool> {
        self.check_spec(spec)?;
        match self {
            Adapter::MySql => mysql::is_empty(spec, guard).await,
            Adapter::Postgres => postgres::is_empty(spec, guard).await,
            Adapter::MongoDb => mongodb::is_empty(spec, guard).await,
            Adapter::Sqlite { .. } => sqlite::is_empty(spec).await,
        }
    }

    /// Loads `artifact` into the target. Without `force` a non-empty target is
    /// refused and left untouched.
    pub async fn restore(
        &self,
        spec: &ConnectionSpec,
        artifact: &Path,
        force: bool,
        guard: &StepGuard,
    ) -> Result<()> {
        self.check_spec(spec)?;
        if !force && !self.is_empty(spec, guard).await? {
            return Err(BackupError::TargetNotEmpty(format!(
                "{spec} already holds data; pass force to overwrite it"
            )));
        }
        info!("Restoring {} into {spec}", artifact.display());
        match self {
            Adapter::MySql => mysql::restore(spec, artifact, guard).await,
            Adapter::Postgres => postgres::restore(spec, artifact, force, guard).await,
            Adapter::MongoDb => mongodb::restore(spec, artifact, force, guard).await,
            Adapter::Sqlite { .. } => sqlite::restore(spec, artifact, guard).await,
        }?;
        info!("Restore of {spec} complete");
        Ok(())
    }
}

impl DumpOutcome {
    fn clean(artifact: Artifact) -> Self {
        Self {
            artifact,
            warnings: Vec::new(),
        }
    }
}

/// Sibling file a dump is written to before it is complete.
pub(crate) fn partial_path(output: &Path) -> PathBuf {
    with_suffix(output, ".partial")
}

/// Best-effort removal of a partial file or directory.
pub(crate) async fn discard(path: &Path) {
    let res = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = res {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {}: {e}", path.display());
        }
    }
}

/// Renames a completed partial dump into place and describes it.
pub(crate) async fn finalize(partial: &Path, output: &Path, engine: Engine, guard: &StepGuard) -> Result<Artifact> {
    if !partial.exists() {
        return Err(BackupError::DumpProcess(format!(
            "{engine} dump produced no output at {}",
            partial.display()
        )));
    }
    if let Err(e) = tokio::fs::rename(partial, output).await {
        discard(partial).await;
        return Err(e.into());
    }
    checksum::describe(output.to_path_buf(), engine, false, guard).await
}

/// Runs an external dump tool that writes to `partial`, then moves the result
/// to `output`. The partial file is removed on any failure.
pub(crate) async fn run_dump(
    cmd: Command,
    partial: &Path,
    output: &Path,
    engine: Engine,
    guard: &StepGuard,
) -> Result<Artifact> {
    discard(partial).await;
    match run_supervised(cmd, None, guard).await {
        Ok(_) => finalize(partial, output, engine, guard).await,
        Err(e) => {
            discard(partial).await;
            Err(dump_failure(e, guard))
        }
    }
}

fn out_of_space(stderr: &str) -> bool {
    stderr.contains("No space left on device")
}

pub(crate) fn dump_failure(err: ProcessError, guard: &StepGuard) -> BackupError {
    match err {
        ProcessError::Failed { ref stderr, .. } if out_of_space(stderr) => {
            BackupError::DiskFull(err.to_string())
        }
        ProcessError::TimedOut(_) => guard.timeout_error(),
        ProcessError::Cancelled(_) => guard.cancelled_error(),
        ProcessError::Io(e) => e.into(),
        other => BackupError::DumpProcess(other.to_string()),
    }
}

pub(crate) fn restore_failure(err: ProcessError, guard: &StepGuard) -> BackupError {
    match err {
        ProcessError::Failed { ref stderr, .. } if out_of_space(stderr) => {
            BackupError::DiskFull(err.to_string())
        }
        ProcessError::TimedOut(_) => guard.timeout_error(),
        ProcessError::Cancelled(_) => guard.cancelled_error(),
        ProcessError::Io(e) => e.into(),
        other => BackupError::RestoreProcess(other.to_string()),
    }
}

/// Last non-empty stdout line of a client query, parsed as a count.
pub(crate) fn parse_count(engine: Engine, stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default();
    line.parse().map_err(|_| {
        BackupError::RestoreProcess(format!("unexpected reply from {engine} client: {line:?}"))
    })
}
