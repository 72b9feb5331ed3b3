use super::{parse_count, partial_path, restore_failure, run_dump};
use crate::guard::StepGuard;
use crate::probe::probe_failure;
use crate::wrapper::{run_supervised, MongoDump, MongoRestore, MongoShell};
use crate::{Artifact, BackupError, ConnectionSpec, Engine, Result};
use std::path::Path;

pub async fn probe(spec: &ConnectionSpec, guard: &StepGuard) -> Result<()> {
    let (cmd, _secrets) = MongoShell::eval(spec, "db.runCommand({ ping: 1 }).ok")?.into_parts();
    let output = run_supervised(cmd, None, guard)
        .await
        .map_err(|e| probe_failure(Engine::MongoDb, e))?;

    let reply = output.stdout.trim();
    if reply.lines().last().map(str::trim) != Some("1") {
        return Err(BackupError::Unreachable {
            engine: Engine::MongoDb,
            message: format!("unexpected ping reply: {reply:?}"),
        });
    }
    Ok(())
}

pub async fn is_empty(spec: &ConnectionSpec, guard: &StepGuard) -> Result<bool> {
    let (cmd, _secrets) = MongoShell::eval(spec, "db.getCollectionNames().length")?.into_parts();
    let output = run_supervised(cmd, None, guard)
        .await
        .map_err(|e| probe_failure(Engine::MongoDb, e))?;
    Ok(parse_count(Engine::MongoDb, &output.stdout)? == 0)
}

pub async fn dump(spec: &ConnectionSpec, output: &Path, guard: &StepGuard) -> Result<Artifact> {
    let partial = partial_path(output);
    let (cmd, _secrets) = MongoDump::command(spec, &partial)?.into_parts();
    run_dump(cmd, &partial, output, Engine::MongoDb, guard).await
}

pub async fn restore(spec: &ConnectionSpec, artifact: &Path, drop: bool, guard: &StepGuard) -> Result<()> {
    let (cmd, _secrets) = MongoRestore::command(spec, artifact, drop)?.into_parts();
    run_supervised(cmd, None, guard)
        .await
        .map_err(|e| restore_failure(e, guard))?;
    Ok(())
}
