use crate::{with_suffix, BackupError, ConnectionSpec, Engine, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const ACQUIRE_ATTEMPTS: usize = 3;

/// An empty lock file younger than this may belong to an owner that has not
/// written its pid yet.
pub const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(10);

/// Advisory lock serialising runs against one (engine, database) pair.
///
/// The lock file holds the owner's PID and is removed on drop. A lock left
/// behind by a dead process, or an empty one older than
/// [`EMPTY_LOCK_GRACE`], is reclaimed.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    pub fn lock_path(lock_dir: &Path, engine: Engine, database: &str) -> Result<PathBuf> {
        let unsafe_chars = Regex::new(r"[^A-Za-z0-9._-]+")
            .map_err(|e| BackupError::ConfigValidation(e.to_string()))?;
        let mut sanitized = unsafe_chars.replace_all(database, "_").into_owned();
        sanitized.truncate(64);
        // Sanitizing can map distinct names together
        let digest = format!("{:x}", Sha256::digest(database.as_bytes()));
        Ok(lock_dir.join(format!("{engine}-{sanitized}-{}.lock", &digest[..8])))
    }

    pub fn acquire_for(lock_dir: &Path, spec: &ConnectionSpec) -> Result<Self> {
        Self::acquire(lock_dir, spec.engine(), spec.database())
    }

    pub fn acquire(lock_dir: &Path, engine: Engine, database: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = Self::lock_path(lock_dir, engine, database)?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let contents = match fs::read_to_string(&path) {
                        Ok(contents) => contents.trim().to_string(),
                        // Released between our open and read
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let owner = contents.parse::<i32>().ok();
                    if !is_stale(&path, &contents, owner)? {
                        return Err(in_progress(&path, engine, database, owner));
                    }
                    info!(
                        "Reclaiming stale lock {} (owner {:?} is gone)",
                        path.display(),
                        contents
                    );
                    if !reclaim(&path, &contents)? {
                        return Err(in_progress(&path, engine, database, None));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Kept losing the race for a reclaimed lock
        Err(in_progress(&path, engine, database, None))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) => warn!("Failed to release lock {}: {e}", self.path.display()),
        }
    }
}

fn in_progress(path: &Path, engine: Engine, database: &str, pid: Option<i32>) -> BackupError {
    let owner = pid.map(|p| format!(" by pid {p}")).unwrap_or_default();
    BackupError::OperationInProgress(format!(
        "{engine} database {database} is locked{owner} ({})",
        path.display()
    ))
}

/// A lock is stale when its owner is gone or its contents are not a pid.
/// An empty file only counts once it is older than [`EMPTY_LOCK_GRACE`].
fn is_stale(path: &Path, contents: &str, owner: Option<i32>) -> Result<bool> {
    if contents.is_empty() {
        let age = match fs::metadata(path) {
            Ok(meta) => meta.modified()?.elapsed().unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        return Ok(age >= EMPTY_LOCK_GRACE);
    }
    Ok(owner.map_or(true, |pid| !process_alive(pid)))
}

/// Moves the stale lock aside and deletes it if it still holds `expected`.
///
/// The rename is atomic, so of several runs reclaiming the same lock only
/// one moves the stale file. A run that moves a lock somebody else has just
/// taken links it back and returns `false`.
fn reclaim(path: &Path, expected: &str) -> Result<bool> {
    let aside = with_suffix(path, &format!(".stale-{}", Uuid::new_v4()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    let moved = fs::read_to_string(&aside).unwrap_or_default();
    if moved.trim() == expected {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    // hard_link never replaces an existing file
    if let Err(e) = fs::hard_link(&aside, path) {
        warn!(
            "Could not put lock {} back after a lost reclaim: {e}",
            path.display()
        );
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: the process exists but belongs to someone else
        Err(_) => true,
    }
}
