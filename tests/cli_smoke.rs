//! Smoke tests for the dbwarden binary: argument parsing, exit codes and the
//! printed result for a real SQLite backup.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn cli_bin() -> Command {
    Command::cargo_bin("dbwarden").expect("binary should build")
}

fn write_config(dir: &Path, db: &Path) -> std::path::PathBuf {
    let config = dir.join("dbwarden.toml");
    fs::write(
        &config,
        format!(
            "[database]\ndatabase = \"{}\"\n\n[orchestrator]\nlock_dir = \"{}\"\nwork_dir = \"{}\"\n",
            db.display(),
            dir.join("locks").display(),
            dir.join("work").display()
        ),
    )
    .unwrap();
    config
}

#[test]
fn prints_help() {
    cli_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("backup").and(predicate::str::contains("restore")));
}

#[test]
fn prints_version() {
    cli_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dbwarden"));
}

#[test]
fn rejects_unknown_engine() {
    cli_bin()
        .args(["backup", "--db-type", "oracle", "--config", "x.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle"));
}

#[test]
fn missing_config_exits_with_one() {
    let dir = tempfile::tempdir().unwrap();
    cli_bin()
        .args(["backup", "--db-type", "sqlite", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("absent.toml"));
}

#[test]
fn sqlite_backup_succeeds_and_prints_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    let mut contents = b"SQLite format 3\0".to_vec();
    contents.extend_from_slice(&[7u8; 2048]);
    fs::write(&db, &contents).unwrap();
    let config = write_config(dir.path(), &db);
    let output = dir.path().join("app.bak");

    cli_bin()
        .env_remove("SENTRY_DSN")
        .args(["backup", "--db-type", "sqlite", "--compress", "--config"])
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .assert()
        .code(0)
        .stdout(
            predicate::str::contains("Backup success")
                .and(predicate::str::contains("\"status\": \"success\""))
                .and(predicate::str::contains("app.bak.archive")),
        );

    assert!(dir.path().join("app.bak.archive").exists());
}

#[test]
fn restore_into_non_empty_target_exits_with_one() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("app.db");
    fs::write(&db, b"SQLite format 3\0existing data").unwrap();
    let artifact = dir.path().join("other.bak");
    fs::write(&artifact, b"SQLite format 3\0replacement").unwrap();
    let config = write_config(dir.path(), &db);
    let log_file = dir.path().join("dbwarden.log");

    cli_bin()
        .env_remove("SENTRY_DSN")
        .args(["restore", "--db-type", "sqlite", "--config"])
        .arg(&config)
        .arg("--backup-file")
        .arg(&artifact)
        .arg("--log-file")
        .arg(&log_file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("target_not_empty"));

    assert_eq!(fs::read(&db).unwrap(), b"SQLite format 3\0existing data");
    assert!(fs::read_to_string(&log_file).unwrap().contains("restore"));
}
