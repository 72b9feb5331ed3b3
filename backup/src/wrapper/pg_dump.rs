use crate::ConnectionSpec;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Options for pg_dump
pub struct PgDumpOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub file: PathBuf,
    pub verbose: bool,
}

impl PgDumpOptions {
    pub fn for_spec(spec: &ConnectionSpec, file: &Path) -> Self {
        Self {
            host: spec.host().to_string(),
            port: spec.port(),
            username: spec.user().to_string(),
            password: spec.password().to_string(),
            database: spec.database().to_string(),
            file: file.to_path_buf(),
            verbose: false,
        }
    }
}

/// Wrapper for pg_dump command
pub struct PgDump;

impl PgDump {
    /// Custom-format dump. pg_dump runs in a single repeatable-read
    /// transaction, so the dump is a consistent snapshot.
    pub fn command(options: &PgDumpOptions) -> Command {
        let mut cmd = Command::new("pg_dump");

        // An empty password means "use .pgpass or trust", never prompt
        if !options.password.is_empty() {
            cmd.env("PGPASSWORD", &options.password);
        }
        cmd.env("PGCONNECT_TIMEOUT", "10");

        cmd.arg("--host")
            .arg(&options.host)
            .arg("--port")
            .arg(options.port.to_string())
            .arg("--username")
            .arg(&options.username)
            .arg("--dbname")
            .arg(&options.database)
            .arg("--format=custom")
            .arg("--no-password")
            .arg("--file")
            .arg(&options.file);

        if options.verbose {
            cmd.arg("--verbose");
        }
        cmd
    }
}
