use anyhow::{bail, Context, Result};
use backup::config::{connection_spec, orchestrator_config, storage_config};
use backup::uploader::StorageUploader;
use backup::{
    BackupRequest, CloudRef, Engine, Operation, OperationResult, Orchestrator, RestoreRequest, Status,
};
use clap::{Args, Parser, Subcommand};
use common::config::{load_config, ToolConfig};
use log::{error, info, warn, LevelFilter};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use storage::StorageProviderType;

#[derive(Parser, Debug)]
#[clap(
    name = "dbwarden",
    about = "Backup and restore for MySQL, PostgreSQL, MongoDB and SQLite",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump a database, optionally compressing and uploading the artifact
    Backup {
        #[clap(flatten)]
        common: CommonArgs,

        /// Where to write the dump (defaults to a timestamped file in the work dir)
        #[clap(long)]
        output: Option<PathBuf>,

        /// Pack the dump into a checksummed .archive
        #[clap(long)]
        compress: bool,
    },

    /// Load a local or cloud artifact into a database
    Restore {
        #[clap(flatten)]
        common: CommonArgs,

        /// Local artifact to restore
        #[clap(long, conflicts_with = "remote_key")]
        backup_file: Option<PathBuf>,

        /// Object key to download (requires --cloud and --bucket)
        #[clap(long)]
        remote_key: Option<String>,

        /// Overwrite a target that already holds data
        #[clap(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// mysql, postgresql, mongodb or sqlite
    #[clap(long, value_parser = parse_engine)]
    db_type: Engine,

    /// Configuration file (JSON or TOML)
    #[clap(long)]
    config: PathBuf,

    /// Object storage provider: s3, gcs or azure
    #[clap(long, value_parser = parse_provider)]
    cloud: Option<StorageProviderType>,

    /// Bucket or container, overriding the configuration file
    #[clap(long)]
    bucket: Option<String>,

    /// Append log output to this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,
}

fn parse_engine(value: &str) -> Result<Engine, String> {
    value.parse().map_err(|e: backup::BackupError| e.to_string())
}

fn parse_provider(value: &str) -> Result<StorageProviderType, String> {
    value.parse().map_err(|e: storage::StorageError| e.to_string())
}

/// Sets up env_logger, wrapped in the Sentry logger when Sentry is active.
fn init_logging(log_file: Option<&Path>, sentry_enabled: bool) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .format_indent(Some(4));

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .format_timestamp_secs();
    }

    let logger = builder.build();
    let max_level = logger.filter();
    if sentry_enabled {
        log::set_boxed_logger(Box::new(sentry_log::SentryLogger::with_dest(logger)))?;
    } else {
        log::set_boxed_logger(Box::new(logger))?;
    }
    log::set_max_level(max_level);
    Ok(())
}

/// Resolves provider and bucket for a cloud transfer, CLI flags first.
fn cloud_settings(
    args: &CommonArgs,
    config: &ToolConfig,
) -> Result<(StorageProviderType, String)> {
    let section = config.storage.as_ref();
    let storage = storage_config(section, args.cloud)?;
    let bucket = args
        .bucket
        .clone()
        .or_else(|| section.and_then(|s| s.bucket.clone()))
        .context("cloud transfer needs --bucket or storage.bucket")?;
    Ok((storage.provider, bucket))
}

async fn build_orchestrator(
    args: &CommonArgs,
    config: &ToolConfig,
    wants_cloud: bool,
) -> Result<Orchestrator> {
    let mut orchestrator = Orchestrator::new(orchestrator_config(&config.orchestrator));
    if wants_cloud {
        let storage = storage_config(config.storage.as_ref(), args.cloud)?;
        let prefix = config.storage.as_ref().and_then(|s| s.prefix.clone());
        let uploader = StorageUploader::connect(&storage, prefix)
            .await
            .context("cannot connect to object storage")?;
        orchestrator = orchestrator.with_uploader(Arc::new(uploader));
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running step");
            token.cancel();
        }
    });
    Ok(orchestrator)
}

async fn execute(command: Commands) -> Result<OperationResult> {
    match command {
        Commands::Backup {
            common,
            output,
            compress,
        } => {
            let config = load_config(&common.config)?;
            let spec = connection_spec(common.db_type, &config.database)?;
            let wants_cloud = common.cloud.is_some();
            let cloud_target = if wants_cloud {
                let (provider, bucket) = cloud_settings(&common, &config)?;
                Some(CloudRef::new(provider, bucket, None))
            } else {
                None
            };
            let orchestrator = build_orchestrator(&common, &config, wants_cloud).await?;
            Ok(orchestrator
                .backup(BackupRequest {
                    spec,
                    output_path: output,
                    compress,
                    cloud_target,
                })
                .await)
        }
        Commands::Restore {
            common,
            backup_file,
            remote_key,
            force,
        } => {
            let config = load_config(&common.config)?;
            let spec = connection_spec(common.db_type, &config.database)?;
            let cloud_source = match (&backup_file, remote_key) {
                (Some(_), _) => None,
                (None, Some(key)) => {
                    let (provider, bucket) = cloud_settings(&common, &config)?;
                    Some(CloudRef::new(provider, bucket, Some(key)))
                }
                (None, None) => bail!("restore needs --backup-file or --cloud, --bucket and --remote-key"),
            };
            let orchestrator = build_orchestrator(&common, &config, cloud_source.is_some()).await?;
            Ok(orchestrator
                .restore(RestoreRequest {
                    spec,
                    artifact_source: backup_file,
                    cloud_source,
                    force,
                })
                .await)
        }
    }
}

fn summary(result: &OperationResult) -> String {
    let verb = match result.operation {
        Operation::Backup => "Backup",
        Operation::Restore => "Restore",
    };
    let artifact = result
        .artifact_ref
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "no artifact".to_string());
    match &result.error {
        Some(error) => format!("{verb} {}: {artifact} ({})", result.status, error.message),
        None => format!("{verb} {}: {artifact}", result.status),
    }
}

fn exit_code(status: Status) -> u8 {
    match status {
        Status::Success => 0,
        Status::Failed => 1,
        Status::Partial => 2,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Backup { common, .. } | Commands::Restore { common, .. } => common.log_file.clone(),
    };
    let sentry_guard = std::env::var_os("SENTRY_DSN").map(|_| {
        sentry::init(sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        })
    });
    if let Err(e) = init_logging(log_file.as_deref(), sentry_guard.is_some()) {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }

    match execute(cli.command).await {
        Ok(result) => {
            let code = ExitCode::from(exit_code(result.status));
            info!("{}", summary(&result));
            println!("{}", summary(&result));
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to serialize the result: {e}"),
            }
            code
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
