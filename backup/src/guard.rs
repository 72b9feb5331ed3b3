//! Deadline and cancellation for a single step.
//!
//! Async work races the guard through [`StepGuard::run`]; blocking copies check
//! it once per chunk through [`GuardedReader`] or [`copy_guarded`].

use crate::{BackupError, Result};
use std::future::Future;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct StepGuard {
    label: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl StepGuard {
    pub fn new(label: impl Into<String>, timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            label: label.into(),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        }
    }

    /// A guard with no deadline and a token nobody cancels.
    pub fn unbounded(label: impl Into<String>) -> Self {
        Self::new(label, None, CancellationToken::new())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn timeout_error(&self) -> BackupError {
        let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
        BackupError::Timeout(format!("{} exceeded {secs}s", self.label))
    }

    pub fn cancelled_error(&self) -> BackupError {
        BackupError::Cancelled(self.label.clone())
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    /// Drives `fut` until it finishes, the deadline passes or the token fires.
    /// The future is dropped on timeout or cancellation.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let remaining = self.remaining();
        let deadline = async move {
            match remaining {
                Some(left) => tokio::time::sleep(left).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(self.cancelled_error()),
            _ = deadline => Err(self.timeout_error()),
        }
    }
}

/// Reader that fails with the guard's error once the step is cancelled or
/// out of time.
pub struct GuardedReader<R> {
    inner: R,
    guard: StepGuard,
}

impl<R: Read> GuardedReader<R> {
    pub fn new(inner: R, guard: StepGuard) -> Self {
        Self { inner, guard }
    }
}

impl<R: Read> Read for GuardedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.guard.check().map_err(io::Error::other)?;
        self.inner.read(buf)
    }
}

/// Copies `reader` into `writer` in fixed chunks, checking the guard between
/// chunks. Returns the number of bytes copied.
pub fn copy_guarded<R: Read, W: Write>(reader: &mut R, writer: &mut W, guard: &StepGuard) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        guard.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
