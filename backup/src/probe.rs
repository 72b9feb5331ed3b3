//! Connection probing ahead of expensive or destructive work.

use crate::wrapper::ProcessError;
use crate::{BackupError, Engine};
use regex::Regex;

/// What the connection is about to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Backup,
    Restore,
}

const AUTH_PATTERNS: &str = r"(?i)(access denied|authentication failed|password authentication|auth(entication)? error|not authori[sz]ed|requires authentication|invalid password|role .* does not exist|login failed)";

fn matches(pattern: &str, text: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Sorts a client tool's complaint into an authentication or reachability
/// failure.
pub fn classify_client_error(engine: Engine, message: &str) -> BackupError {
    let message = message.trim().to_string();
    if matches(AUTH_PATTERNS, &message) {
        BackupError::Authentication { engine, message }
    } else {
        BackupError::Unreachable { engine, message }
    }
}

/// Maps a failed probe command to the probe error taxonomy.
pub fn probe_failure(engine: Engine, err: ProcessError) -> BackupError {
    match err {
        ProcessError::NotFound(program) => BackupError::UnsupportedEngine(format!(
            "{program} is not installed; the {engine} client tools are required"
        )),
        ProcessError::Failed { stderr, .. } => classify_client_error(engine, &stderr),
        ProcessError::TimedOut(program) => BackupError::Unreachable {
            engine,
            message: format!("{program} timed out"),
        },
        ProcessError::Cancelled(program) => BackupError::Cancelled(program),
        other => BackupError::Unreachable {
            engine,
            message: other.to_string(),
        },
    }
}
