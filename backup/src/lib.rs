//! Backup and restore orchestration for MySQL, PostgreSQL, MongoDB and SQLite.
//!
//! [`Orchestrator`] is the entry point: it probes the database, runs the
//! engine's native dump or restore tooling, optionally compresses the artifact
//! into a self-describing archive and moves it to or from object storage. Every
//! run yields one [`OperationResult`] and failures are reported through the
//! single [`BackupError`] taxonomy.

pub mod adapter;
pub mod checksum;
pub mod codec;
pub mod common;
pub mod config;
pub mod events;
pub mod guard;
pub mod lock;
pub mod orchestrator;
pub mod probe;
pub mod uploader;
pub mod wrapper;

pub use self::common::*;
pub use orchestrator::{
    BackupRequest, Orchestrator, OrchestratorConfig, RestoreRequest, RetentionPolicy, RetryPolicy,
};

use serde::Serialize;
use std::io;
use storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    #[error("Authentication failed for {engine}: {message}")]
    Authentication { engine: Engine, message: String },

    #[error("{engine} server unreachable: {message}")]
    Unreachable { engine: Engine, message: String },

    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    #[error("Dump failed: {0}")]
    DumpProcess(String),

    #[error("Restore failed: {0}")]
    RestoreProcess(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    #[error("Target database is not empty: {0}")]
    TargetNotEmpty(String),

    #[error("Engine mismatch: artifact was produced by {found}, target is {expected}")]
    EngineMismatch { expected: Engine, found: Engine },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation already in progress: {0}")]
    OperationInProgress(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

/// Stable, serializable classification of a [`BackupError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigValidation,
    Authentication,
    Unreachable,
    UnsupportedEngine,
    DumpProcess,
    RestoreProcess,
    Timeout,
    DiskFull,
    CorruptArtifact,
    TargetNotEmpty,
    EngineMismatch,
    StorageUnavailable,
    Permission,
    NotFound,
    OperationInProgress,
    Cancelled,
    Storage,
    Io,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::ConfigValidation(_) => ErrorKind::ConfigValidation,
            BackupError::Authentication { .. } => ErrorKind::Authentication,
            BackupError::Unreachable { .. } => ErrorKind::Unreachable,
            BackupError::UnsupportedEngine(_) => ErrorKind::UnsupportedEngine,
            BackupError::DumpProcess(_) => ErrorKind::DumpProcess,
            BackupError::RestoreProcess(_) => ErrorKind::RestoreProcess,
            BackupError::Timeout(_) => ErrorKind::Timeout,
            BackupError::DiskFull(_) => ErrorKind::DiskFull,
            BackupError::CorruptArtifact(_) => ErrorKind::CorruptArtifact,
            BackupError::TargetNotEmpty(_) => ErrorKind::TargetNotEmpty,
            BackupError::EngineMismatch { .. } => ErrorKind::EngineMismatch,
            BackupError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            BackupError::Permission(_) => ErrorKind::Permission,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            BackupError::Cancelled(_) => ErrorKind::Cancelled,
            BackupError::Storage(_) => ErrorKind::Storage,
            BackupError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only transient storage failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::StorageUnavailable(_))
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        // Guard trips travel through io::Read/Write as wrapped BackupErrors
        if err.get_ref().is_some_and(|inner| inner.is::<BackupError>()) {
            return match err.into_inner().map(|inner| inner.downcast::<BackupError>()) {
                Some(Ok(inner)) => *inner,
                _ => BackupError::Io(io::Error::other("wrapped error could not be recovered")),
            };
        }
        if err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32) {
            return BackupError::DiskFull(err.to_string());
        }
        BackupError::Io(err)
    }
}

impl From<StorageError> for BackupError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => BackupError::StorageUnavailable(msg),
            StorageError::PermissionDenied(msg) => BackupError::Permission(msg),
            StorageError::NotFound(msg) => BackupError::NotFound(msg),
            StorageError::Configuration(msg) => BackupError::ConfigValidation(msg),
            StorageError::Io(e) => BackupError::from(e),
            other => BackupError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_guard_errors_survive_io_round_trip() {
        let io_err = io::Error::other(BackupError::Cancelled("dump".to_string()));
        let err = BackupError::from(io_err);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn enospc_is_disk_full() {
        let io_err = io::Error::from_raw_os_error(nix::errno::Errno::ENOSPC as i32);
        assert_eq!(BackupError::from(io_err).kind(), ErrorKind::DiskFull);
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(BackupError::from(other).kind(), ErrorKind::Io);
    }

    #[test]
    fn storage_errors_keep_their_class() {
        let err = BackupError::from(StorageError::Unavailable("503".to_string()));
        assert!(err.is_retryable());
        let err = BackupError::from(StorageError::PermissionDenied("403".to_string()));
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(!err.is_retryable());
        let err = BackupError::from(StorageError::Request("400".to_string()));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
