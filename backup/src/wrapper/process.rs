use crate::guard::StepGuard;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Time a child gets between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_TAIL: usize = 64 * 1024;

#[derive(Debug)]
pub enum ProcessError {
    /// The program is not installed or not on PATH
    NotFound(String),
    Spawn(String, io::Error),
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    TimedOut(String),
    Cancelled(String),
    Io(io::Error),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NotFound(program) => write!(f, "{program} not found in PATH"),
            ProcessError::Spawn(program, e) => write!(f, "failed to start {program}: {e}"),
            ProcessError::Failed {
                program,
                status,
                stderr,
            } => {
                write!(f, "{program} exited with {status}")?;
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            ProcessError::TimedOut(program) => write!(f, "{program} ran past its deadline"),
            ProcessError::Cancelled(program) => write!(f, "{program} was cancelled"),
            ProcessError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Captured output of a finished child, keeping only the last 64 KiB of each
/// stream.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Program and arguments with secrets masked, for logs.
pub fn describe(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    for arg in std_cmd.get_args() {
        let arg = arg.to_string_lossy();
        if arg.starts_with("--password=") {
            parts.push("--password=<redacted>".to_string());
        } else {
            parts.push(arg.into_owned());
        }
    }
    parts.join(" ")
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

fn read_tail<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut tail = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > OUTPUT_TAIL {
                        let excess = tail.len() - OUTPUT_TAIL;
                        tail.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child, program: &str) {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to {program} (pid {pid})");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal {program}: {e}");
        }
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("{program} ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {program}: {e}");
            }
        }
    }
}

/// Runs `cmd` to completion under `guard`.
///
/// `stdin` is streamed from a file when given. On timeout or cancellation the
/// child is terminated before this returns.
pub async fn run_supervised(
    mut cmd: Command,
    stdin: Option<&Path>,
    guard: &StepGuard,
) -> Result<ProcessOutput, ProcessError> {
    let program = program_name(&cmd);
    debug!("Running command: {}", describe(&cmd));

    let stdin = match stdin {
        Some(path) => Stdio::from(std::fs::File::open(path).map_err(ProcessError::Io)?),
        None => Stdio::null(),
    };
    cmd.stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ProcessError::NotFound(program.clone()),
        _ => ProcessError::Spawn(program.clone(), e),
    })?;
    let stdout = read_tail(child.stdout.take());
    let stderr = read_tail(child.stderr.take());

    let remaining = guard.remaining();
    let deadline = async move {
        match remaining {
            Some(left) => tokio::time::sleep(left).await,
            None => std::future::pending::<()>().await,
        }
    };

    let status = tokio::select! {
        status = child.wait() => status.map_err(ProcessError::Io)?,
        _ = guard.cancel_token().cancelled() => {
            terminate(&mut child, &program).await;
            return Err(ProcessError::Cancelled(program));
        }
        _ = deadline => {
            terminate(&mut child, &program).await;
            return Err(ProcessError::TimedOut(program));
        }
    };

    let output = ProcessOutput {
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
    };
    if status.success() {
        Ok(output)
    } else {
        Err(ProcessError::Failed {
            program,
            status,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn captures_output_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let err = run_supervised(cmd, None, &StepGuard::unbounded("test"))
            .await
            .unwrap_err();
        match err {
            ProcessError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "err");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo ok");
        let out = run_supervised(cmd, None, &StepGuard::unbounded("test"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let cmd = Command::new("dbwarden-no-such-tool");
        let err = run_supervised(cmd, None, &StepGuard::unbounded("test"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }

    #[tokio::test]
    async fn deadline_terminates_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let guard = StepGuard::new("dump", Some(Duration::from_millis(100)), CancellationToken::new());
        let started = Instant::now();
        let err = run_supervised(cmd, None, &guard).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let token = CancellationToken::new();
        let guard = StepGuard::new("restore", None, token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = run_supervised(cmd, None, &guard).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ProcessError::Cancelled(_)));
    }

    #[test]
    fn passwords_are_masked_in_descriptions() {
        let mut cmd = Command::new("mongodump");
        cmd.arg("--username=backup").arg("--password=hunter2");
        let text = describe(&cmd);
        assert!(!text.contains("hunter2"));
        assert!(text.contains("--password=<redacted>"));
    }

    #[tokio::test]
    async fn stdin_streams_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("script.sql");
        std::fs::write(&input, "SELECT 1;\n").unwrap();
        let cmd = Command::new("cat");
        let out = run_supervised(cmd, Some(&input), &StepGuard::unbounded("test"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "SELECT 1;\n");
    }
}
