use super::{discard, finalize, partial_path, DumpOutcome};
use crate::guard::{copy_guarded, StepGuard};
use crate::probe::Purpose;
use crate::wrapper::{run_supervised, ProcessError};
use crate::{with_suffix, BackupError, ConnectionSpec, Engine, Result};
use log::{debug, info, warn};
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tokio::process::Command;

/// Sidecars whose presence means a writer may be mid-transaction.
const WRITE_SIDECARS: [&str; 2] = ["-wal", "-journal"];
/// Sidecars that belong to the database being replaced on restore.
const STALE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];
const SET_ASIDE_SUFFIX: &str = ".dbwarden-old";

fn unreachable(message: String) -> BackupError {
    BackupError::Unreachable {
        engine: Engine::Sqlite,
        message,
    }
}

fn join_error(err: tokio::task::JoinError) -> BackupError {
    BackupError::Io(io::Error::other(err))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub async fn probe(spec: &ConnectionSpec, purpose: Purpose) -> Result<()> {
    let path = spec.sqlite_path();
    match purpose {
        Purpose::Backup => {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| unreachable(format!("{}: {e}", path.display())))?;
            if !meta.is_file() {
                return Err(unreachable(format!("{} is not a regular file", path.display())));
            }
            tokio::fs::File::open(path)
                .await
                .map_err(|e| unreachable(format!("{} is not readable: {e}", path.display())))?;
        }
        Purpose::Restore => {
            let dir = parent_dir(path);
            let meta = tokio::fs::metadata(&dir)
                .await
                .map_err(|e| unreachable(format!("{}: {e}", dir.display())))?;
            if !meta.is_dir() {
                return Err(unreachable(format!("{} is not a directory", dir.display())));
            }
            if path.is_dir() {
                return Err(unreachable(format!("{} is a directory", path.display())));
            }
            let probe_dir = dir.clone();
            tokio::task::spawn_blocking(move || NamedTempFile::new_in(&probe_dir))
                .await
                .map_err(join_error)?
                .map_err(|e| unreachable(format!("{} is not writable: {e}", dir.display())))?;
        }
    }
    debug!("SQLite probe of {} succeeded", path.display());
    Ok(())
}

pub async fn is_empty(spec: &ConnectionSpec) -> Result<bool> {
    match tokio::fs::metadata(spec.sqlite_path()).await {
        Ok(meta) => Ok(meta.len() == 0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct FileState {
    len: u64,
    modified: Option<SystemTime>,
}

impl From<&Metadata> for FileState {
    fn from(meta: &Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

fn sidecar_warnings(source: &Path) -> Vec<String> {
    WRITE_SIDECARS
        .iter()
        .filter_map(|suffix| {
            let sidecar = with_suffix(source, suffix);
            let len = fs::metadata(&sidecar).ok()?.len();
            (len > 0).then(|| {
                format!(
                    "ConsistencyWarning: {} is non-empty ({len} bytes); {} may be mid-write and the copy can miss changes not yet checkpointed",
                    sidecar.display(),
                    source.display()
                )
            })
        })
        .collect()
}

/// Byte copy of the database file, reporting any sign that it changed under
/// us.
fn copy_snapshot(source: &Path, partial: &Path, guard: &StepGuard) -> Result<Vec<String>> {
    let mut warnings = sidecar_warnings(source);
    let mut input = File::open(source)?;
    let before = FileState::from(&input.metadata()?);

    let mut output = File::create(partial)?;
    let copied = copy_guarded(&mut input, &mut output, guard)?;
    output.sync_all()?;

    let after = FileState::from(&fs::metadata(source)?);
    if before != after {
        warnings.push(format!(
            "ConsistencyWarning: {} changed while it was being copied (size {} -> {}); the copy may be inconsistent",
            source.display(),
            before.len,
            after.len
        ));
    }
    debug!("Copied {copied} bytes from {}", source.display());
    Ok(warnings)
}

async fn run_quiesce(command: &str, guard: &StepGuard) -> Result<()> {
    info!("Running quiesce command: {command}");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run_supervised(cmd, None, guard).await.map_err(|e| match e {
        ProcessError::TimedOut(_) => guard.timeout_error(),
        ProcessError::Cancelled(_) => guard.cancelled_error(),
        other => BackupError::DumpProcess(format!("quiesce command failed: {other}")),
    })?;
    Ok(())
}

pub async fn dump(
    spec: &ConnectionSpec,
    output: &Path,
    quiesce_command: Option<&str>,
    guard: &StepGuard,
) -> Result<DumpOutcome> {
    if let Some(command) = quiesce_command {
        run_quiesce(command, guard).await?;
    }

    let source = spec.sqlite_path().to_path_buf();
    let partial = partial_path(output);
    discard(&partial).await;

    let (src, part, copy_guard) = (source.clone(), partial.clone(), guard.clone());
    let copied = tokio::task::spawn_blocking(move || copy_snapshot(&src, &part, &copy_guard))
        .await
        .map_err(join_error)?;
    let warnings = match copied {
        Ok(warnings) => warnings,
        Err(e) => {
            discard(&partial).await;
            return Err(e);
        }
    };

    let artifact = finalize(&partial, output, Engine::Sqlite, guard).await?;
    Ok(DumpOutcome { artifact, warnings })
}

/// Renames the destination's sidecars to `<sidecar>.dbwarden-old` and
/// returns the (original, moved) pairs.
fn set_aside_sidecars(dest: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut moved = Vec::new();
    for suffix in STALE_SIDECARS {
        let sidecar = with_suffix(dest, suffix);
        let aside = with_suffix(&sidecar, SET_ASIDE_SUFFIX);
        match fs::rename(&sidecar, &aside) {
            Ok(()) => moved.push((sidecar, aside)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                put_back_sidecars(&moved);
                return Err(e.into());
            }
        }
    }
    Ok(moved)
}

fn put_back_sidecars(moved: &[(PathBuf, PathBuf)]) {
    for (sidecar, aside) in moved {
        if let Err(e) = fs::rename(aside, sidecar) {
            warn!("Failed to restore {} from {}: {e}", sidecar.display(), aside.display());
        }
    }
}

fn restore_blocking(artifact: &Path, dest: &Path, guard: &StepGuard) -> Result<()> {
    let mut input = File::open(artifact)?;
    let mut staged = NamedTempFile::new_in(parent_dir(dest))?;
    copy_guarded(&mut input, staged.as_file_mut(), guard)?;
    staged.as_file().sync_all()?;
    guard.check()?;

    // Old journal files would be replayed against the new database
    let set_aside = set_aside_sidecars(dest)?;
    if let Err(e) = staged.persist(dest) {
        put_back_sidecars(&set_aside);
        return Err(BackupError::RestoreProcess(format!(
            "could not move the restored database to {}: {}",
            dest.display(),
            e.error
        )));
    }
    for (_, aside) in &set_aside {
        match fs::remove_file(aside) {
            Ok(()) => debug!("Removed stale {}", aside.display()),
            Err(e) => warn!("Failed to remove {}: {e}", aside.display()),
        }
    }

    if let Ok(dir) = File::open(parent_dir(dest)) {
        if let Err(e) = dir.sync_all() {
            debug!("Directory sync failed: {e}");
        }
    }
    Ok(())
}

/// Copies the artifact next to the destination and renames it into place, so
/// the destination is never half-written.
pub async fn restore(spec: &ConnectionSpec, artifact: &Path, guard: &StepGuard) -> Result<()> {
    if artifact.is_dir() {
        return Err(BackupError::RestoreProcess(format!(
            "{} is a directory; sqlite restores take a single database file",
            artifact.display()
        )));
    }
    let (artifact, dest, guard) = (
        artifact.to_path_buf(),
        spec.sqlite_path().to_path_buf(),
        guard.clone(),
    );
    tokio::task::spawn_blocking(move || restore_blocking(&artifact, &dest, &guard))
        .await
        .map_err(join_error)?
}
