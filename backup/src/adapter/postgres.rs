use super::{partial_path, restore_failure, run_dump};
use crate::guard::StepGuard;
use crate::probe::classify_client_error;
use crate::wrapper::{run_supervised, PgDump, PgDumpOptions, PgRestore, PgRestoreOptions};
use crate::{Artifact, BackupError, ConnectionSpec, Engine, Result};
use log::debug;
use std::path::Path;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

const USER_TABLES: &str = "SELECT count(*) FROM pg_catalog.pg_tables \
     WHERE schemaname NOT IN ('pg_catalog', 'information_schema')";

fn connection_error(err: tokio_postgres::Error) -> BackupError {
    let message = err
        .as_db_error()
        .map(|db| format!("{}: {}", db.severity(), db.message()))
        .unwrap_or_else(|| err.to_string());
    match err.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            BackupError::Authentication {
                engine: Engine::PostgreSql,
                message,
            }
        }
        Some(_) => BackupError::Unreachable {
            engine: Engine::PostgreSql,
            message,
        },
        None => classify_client_error(Engine::PostgreSql, &message),
    }
}

/// Opens a fresh connection for one step; it is dropped with the client.
async fn connect(spec: &ConnectionSpec, guard: &StepGuard) -> Result<Client> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(spec.host())
        .port(spec.port())
        .user(spec.user())
        .dbname(spec.database())
        .application_name("dbwarden")
        .connect_timeout(Duration::from_secs(10));
    if !spec.password().is_empty() {
        config.password(spec.password());
    }

    let (client, connection) = guard
        .run(async { config.connect(NoTls).await.map_err(connection_error) })
        .await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("PostgreSQL connection closed with error: {e}");
        }
    });
    Ok(client)
}

pub async fn probe(spec: &ConnectionSpec, guard: &StepGuard) -> Result<()> {
    let client = connect(spec, guard).await?;
    guard
        .run(async { client.simple_query("SELECT 1").await.map_err(connection_error) })
        .await?;
    debug!("PostgreSQL probe of {spec} succeeded");
    Ok(())
}

pub async fn is_empty(spec: &ConnectionSpec, guard: &StepGuard) -> Result<bool> {
    let client = connect(spec, guard).await?;
    let row = guard
        .run(async {
            client
                .query_one(USER_TABLES, &[])
                .await
                .map_err(|e| BackupError::RestoreProcess(format!("table count failed: {e}")))
        })
        .await?;
    let tables: i64 = row
        .try_get(0)
        .map_err(|e| BackupError::RestoreProcess(format!("table count failed: {e}")))?;
    Ok(tables == 0)
}

pub async fn dump(spec: &ConnectionSpec, output: &Path, guard: &StepGuard) -> Result<Artifact> {
    let partial = partial_path(output);
    let cmd = PgDump::command(&PgDumpOptions::for_spec(spec, &partial));
    run_dump(cmd, &partial, output, Engine::PostgreSql, guard).await
}

pub async fn restore(spec: &ConnectionSpec, artifact: &Path, clean: bool, guard: &StepGuard) -> Result<()> {
    let cmd = PgRestore::command(&PgRestoreOptions::for_spec(spec, artifact, clean));
    run_supervised(cmd, None, guard)
        .await
        .map_err(|e| restore_failure(e, guard))?;
    Ok(())
}
