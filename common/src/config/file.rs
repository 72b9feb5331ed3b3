use config::{Config, ConfigError, Environment, File};
use log::{debug, info};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level configuration file layout.
#[derive(Debug, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    pub orchestrator: OrchestratorSection,
}

/// Raw `database` section. Every key is optional here; the backup crate
/// decides which ones the selected engine actually requires.
#[derive(Clone, Default, Deserialize)]
pub struct DatabaseSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl fmt::Debug for DatabaseSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct StorageSection {
    /// "s3", "gcs" or "azure"
    pub provider: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Azure storage account name
    pub account: Option<String>,
    /// Azure shared access signature, without the leading '?'
    pub sas_token: Option<String>,
}

impl fmt::Debug for StorageSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSection")
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("account", &self.account)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    pub lock_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Per-step deadline for dump/restore work; 0 disables it
    pub step_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub keep_intermediate: bool,
    pub compression_level: u32,
    pub quiesce_command: Option<String>,
}

/// Expands `~` and environment variables in a configured path.
pub fn expand_path(path: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.into_owned()))
        .map_err(|e| ConfigError::Message(format!("cannot expand path {path}: {e}")))
}

/// Loads the configuration file at `path` (JSON or TOML, chosen by extension),
/// then overlays `DBWARDEN__SECTION__KEY` environment variables.
pub fn load_config(path: &Path) -> Result<ToolConfig, ConfigError> {
    let path = expand_path(&path.to_string_lossy())?;
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    info!("Loading configuration from {}", path.display());

    let scratch = std::env::temp_dir().join("dbwarden");
    let scratch = scratch.to_string_lossy().into_owned();

    let config_builder = Config::builder()
        .set_default("orchestrator.lock_dir", scratch.clone())?
        .set_default("orchestrator.work_dir", scratch)?
        .set_default("orchestrator.step_timeout_secs", 3600)?
        .set_default("orchestrator.retry_attempts", 3)?
        .set_default("orchestrator.retry_base_delay_ms", 1000)?
        .set_default("orchestrator.keep_intermediate", false)?
        .set_default("orchestrator.compression_level", 6)?
        .set_default("orchestrator.quiesce_command", None::<String>)?
        .add_source(File::from(path.as_path()))
        .add_source(
            Environment::with_prefix("DBWARDEN")
                .separator("__")
                .try_parsing(true),
        );

    let mut config: ToolConfig = config_builder.build()?.try_deserialize()?;

    config.orchestrator.lock_dir = expand_path(&config.orchestrator.lock_dir.to_string_lossy())?;
    config.orchestrator.work_dir = expand_path(&config.orchestrator.work_dir.to_string_lossy())?;
    debug!("Loaded configuration: {config:?}");

    Ok(config)
}
