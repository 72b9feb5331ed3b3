use crate::ConnectionSpec;
use std::path::Path;
use tokio::process::Command;

/// Connection flags shared by the mysql client tools. The password travels in
/// MYSQL_PWD so it never shows up in the process list.
fn connect(program: &str, spec: &ConnectionSpec) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("MYSQL_PWD", spec.password())
        .arg("--host")
        .arg(spec.host())
        .arg("--port")
        .arg(spec.port().to_string())
        .arg("--user")
        .arg(spec.user())
        .arg("--connect-timeout=10");
    cmd
}

/// Wrapper for mysqldump
pub struct MySqlDump;

impl MySqlDump {
    /// Consistent InnoDB dump written straight to `result_file`.
    pub fn command(spec: &ConnectionSpec, result_file: &Path) -> Command {
        let mut cmd = connect("mysqldump", spec);
        cmd.arg("--single-transaction")
            .arg("--quick")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg(format!("--result-file={}", result_file.display()))
            .arg(spec.database());
        cmd
    }
}

/// Wrapper for the mysql command-line client
pub struct MySqlClient;

impl MySqlClient {
    /// Runs one statement against the spec's database; rows come back
    /// tab-separated without a header.
    pub fn query(spec: &ConnectionSpec, sql: &str) -> Command {
        let mut cmd = connect("mysql", spec);
        cmd.arg("--batch")
            .arg("--skip-column-names")
            .arg("-e")
            .arg(sql)
            .arg(spec.database());
        cmd
    }

    /// Executes the SQL script fed on stdin.
    pub fn restore(spec: &ConnectionSpec) -> Command {
        let mut cmd = connect("mysql", spec);
        cmd.arg(spec.database());
        cmd
    }
}
