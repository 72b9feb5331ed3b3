use super::{parse_count, partial_path, restore_failure, run_dump};
use crate::guard::StepGuard;
use crate::probe::probe_failure;
use crate::wrapper::{run_supervised, MySqlClient, MySqlDump};
use crate::{Artifact, BackupError, ConnectionSpec, Engine, Result};
use std::path::Path;

const USER_TABLES: &str =
    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE()";

pub async fn probe(spec: &ConnectionSpec, guard: &StepGuard) -> Result<()> {
    run_supervised(MySqlClient::query(spec, "SELECT 1"), None, guard)
        .await
        .map_err(|e| probe_failure(Engine::MySql, e))?;
    Ok(())
}

pub async fn is_empty(spec: &ConnectionSpec, guard: &StepGuard) -> Result<bool> {
    let output = run_supervised(MySqlClient::query(spec, USER_TABLES), None, guard)
        .await
        .map_err(|e| probe_failure(Engine::MySql, e))?;
    Ok(parse_count(Engine::MySql, &output.stdout)? == 0)
}

pub async fn dump(spec: &ConnectionSpec, output: &Path, guard: &StepGuard) -> Result<Artifact> {
    let partial = partial_path(output);
    let cmd = MySqlDump::command(spec, &partial);
    run_dump(cmd, &partial, output, Engine::MySql, guard).await
}

/// Streams the SQL script into the mysql client.
pub async fn restore(spec: &ConnectionSpec, artifact: &Path, guard: &StepGuard) -> Result<()> {
    if artifact.is_dir() {
        return Err(BackupError::RestoreProcess(format!(
            "{} is a directory; mysql restores take a single SQL script",
            artifact.display()
        )));
    }
    run_supervised(MySqlClient::restore(spec), Some(artifact), guard)
        .await
        .map_err(|e| restore_failure(e, guard))?;
    Ok(())
}
