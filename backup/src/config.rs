//! Turns loaded configuration sections into validated core types.

use crate::orchestrator::{OrchestratorConfig, RetentionPolicy, RetryPolicy};
use crate::{BackupError, ConnectionSpec, Engine, Result};
use ::common::config::{expand_path, DatabaseSection, OrchestratorSection, StorageSection};
use std::time::Duration;
use storage::{StorageConfig, StorageProviderType};

/// Builds the connection for `engine` from the `database` section. Network
/// engines need all of host, port, user, password and database (the password
/// may be empty); SQLite needs only `database`, a file path.
pub fn connection_spec(engine: Engine, section: &DatabaseSection) -> Result<ConnectionSpec> {
    if engine == Engine::Sqlite {
        let database = section.database.as_deref().ok_or_else(|| {
            BackupError::ConfigValidation("missing database key: database".to_string())
        })?;
        let path = expand_path(database).map_err(|e| BackupError::ConfigValidation(e.to_string()))?;
        return ConnectionSpec::sqlite(path.to_string_lossy());
    }

    let mut missing = Vec::new();
    if section.host.is_none() {
        missing.push("host");
    }
    if section.port.is_none() {
        missing.push("port");
    }
    if section.user.is_none() {
        missing.push("user");
    }
    if section.password.is_none() {
        missing.push("password");
    }
    if section.database.is_none() {
        missing.push("database");
    }
    match (
        &section.host,
        section.port,
        &section.user,
        &section.password,
        &section.database,
    ) {
        (Some(host), Some(port), Some(user), Some(password), Some(database)) => {
            ConnectionSpec::new(engine, host, port, user, password, database)
        }
        _ => Err(BackupError::ConfigValidation(format!(
            "missing database keys for {engine}: {}",
            missing.join(", ")
        ))),
    }
}

pub fn orchestrator_config(section: &OrchestratorSection) -> OrchestratorConfig {
    OrchestratorConfig {
        lock_dir: section.lock_dir.clone(),
        work_dir: section.work_dir.clone(),
        step_timeout: (section.step_timeout_secs > 0)
            .then(|| Duration::from_secs(section.step_timeout_secs)),
        retry: RetryPolicy {
            max_attempts: section.retry_attempts.max(1),
            base_delay: Duration::from_millis(section.retry_base_delay_ms),
        },
        retention: RetentionPolicy {
            keep_intermediate: section.keep_intermediate,
        },
        compression_level: section.compression_level,
        quiesce_command: section.quiesce_command.clone(),
    }
}

/// Storage settings from the `storage` section; `provider` overrides the
/// section's provider.
pub fn storage_config(
    section: Option<&StorageSection>,
    provider: Option<StorageProviderType>,
) -> Result<StorageConfig> {
    let provider = match (provider, section.and_then(|s| s.provider.as_deref())) {
        (Some(provider), _) => provider,
        (None, Some(name)) => name
            .parse::<StorageProviderType>()
            .map_err(|e| BackupError::ConfigValidation(e.to_string()))?,
        (None, None) => {
            return Err(BackupError::ConfigValidation(
                "no storage provider given (use s3, gcs or azure)".to_string(),
            ))
        }
    };

    let mut config = StorageConfig::new(provider);
    if let Some(section) = section {
        config.region = section.region.clone();
        config.endpoint = section.endpoint.clone();
        config.access_key = section.access_key.clone();
        config.secret_key = section.secret_key.clone();
        config.account = section.account.clone();
        config.sas_token = section.sas_token.clone();
    }
    if provider == StorageProviderType::Azure && config.account.is_none() && config.endpoint.is_none() {
        return Err(BackupError::ConfigValidation(
            "azure storage needs storage.account or storage.endpoint".to_string(),
        ));
    }
    Ok(config)
}
