use crate::ConnectionSpec;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Options for pg_restore
pub struct PgRestoreOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub file: PathBuf,
    /// Drop existing objects before recreating them
    pub clean: bool,
}

impl PgRestoreOptions {
    pub fn for_spec(spec: &ConnectionSpec, file: &Path, clean: bool) -> Self {
        Self {
            host: spec.host().to_string(),
            port: spec.port(),
            username: spec.user().to_string(),
            password: spec.password().to_string(),
            database: spec.database().to_string(),
            file: file.to_path_buf(),
            clean,
        }
    }
}

/// Wrapper for pg_restore utility
pub struct PgRestore;

impl PgRestore {
    pub fn command(options: &PgRestoreOptions) -> Command {
        let mut cmd = Command::new("pg_restore");

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
            .arg("--no-password")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--exit-on-error");

        if options.clean {
            cmd.arg("--clean").arg("--if-exists");
        }

        cmd.arg(&options.file);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn clean_only_when_forced() {
        let spec = ConnectionSpec::new(Engine::PostgreSql, "db", 5432, "app", "", "orders").unwrap();
        let file = Path::new("/tmp/orders.dump");

        let plain = args(&PgRestore::command(&PgRestoreOptions::for_spec(&spec, file, false)));
        assert!(plain.contains(&"--exit-on-error".to_string()));
        assert!(!plain.contains(&"--clean".to_string()));
        assert_eq!(plain.last().map(String::as_str), Some("/tmp/orders.dump"));

        let forced = args(&PgRestore::command(&PgRestoreOptions::for_spec(&spec, file, true)));
        assert!(forced.contains(&"--clean".to_string()));
        assert!(forced.contains(&"--if-exists".to_string()));
    }
}
