use crate::adapter::discard;
use crate::checksum::{self, sniff_engine};
use crate::codec::ArtifactCodec;
use crate::guard::StepGuard;
use crate::{with_suffix, Artifact, BackupError, CloudRef, Engine, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use storage::{
    content_type_for, StorageConfig, StorageProvider, StorageProviderFactory, StorageProviderType,
};

/// Moves artifacts to and from object storage.
#[async_trait]
pub trait CloudUploader: Send + Sync {
    /// Uploads `artifact` and returns the reference it was stored under.
    async fn upload(&self, artifact: &Artifact, target: &CloudRef) -> Result<CloudRef>;

    /// Downloads `remote` to `local_path`, verifying it under `guard`.
    async fn download(
        &self,
        remote: &CloudRef,
        local_path: &Path,
        guard: &StepGuard,
    ) -> Result<Artifact>;
}

const META_ENGINE: &str = "engine";
const META_CHECKSUM: &str = "checksum";
const META_COMPRESSED: &str = "compressed";
const META_CREATED_AT: &str = "created-at";

/// [`CloudUploader`] over a [`StorageProvider`].
pub struct StorageUploader {
    provider: Box<dyn StorageProvider>,
    kind: StorageProviderType,
    prefix: Option<String>,
}

impl StorageUploader {
    pub fn new(provider: Box<dyn StorageProvider>, kind: StorageProviderType, prefix: Option<String>) -> Self {
        Self {
            provider,
            kind,
            prefix: prefix.filter(|p| !p.trim_matches('/').is_empty()),
        }
    }

    pub async fn connect(config: &StorageConfig, prefix: Option<String>) -> Result<Self> {
        let provider = StorageProviderFactory::create(config).await?;
        info!("Using {} for artifact storage", provider.name());
        Ok(Self::new(provider, config.provider, prefix))
    }

    /// Object key for an artifact uploaded without an explicit key.
    pub fn default_key(&self, file_name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{file_name}", prefix.trim_matches('/')),
            None => file_name.to_string(),
        }
    }

    fn check_provider(&self, remote: &CloudRef) -> Result<()> {
        if remote.provider != self.kind {
            return Err(BackupError::ConfigValidation(format!(
                "{remote} does not belong to the configured {} storage",
                self.kind
            )));
        }
        Ok(())
    }
}

fn verify_and_describe(
    path: PathBuf,
    expected: Option<String>,
    engine_hint: Option<Engine>,
    created_at: Option<DateTime<Utc>>,
    compressed_hint: bool,
    guard: StepGuard,
) -> Result<Artifact> {
    let (digest, size_bytes) = checksum::checksum_path(&path, &guard)?;
    if let Some(expected) = expected {
        if expected != digest {
            return Err(BackupError::CorruptArtifact(format!(
                "{}: checksum {digest} does not match the recorded {expected}",
                path.display()
            )));
        }
    }

    let compressed = compressed_hint || checksum::is_compressed(&path)?;
    let engine = match engine_hint {
        Some(engine) => Some(engine),
        None if compressed => Some(ArtifactCodec::read_header(&path)?.engine),
        None => sniff_engine(&path)?,
    };
    let engine = engine.ok_or_else(|| {
        BackupError::CorruptArtifact(format!(
            "cannot tell which engine produced {}",
            path.display()
        ))
    })?;

    Ok(Artifact {
        path,
        engine,
        created_at: created_at.unwrap_or_else(Utc::now),
        size_bytes,
        compressed,
        checksum: digest,
    })
}

#[async_trait]
impl CloudUploader for StorageUploader {
    async fn upload(&self, artifact: &Artifact, target: &CloudRef) -> Result<CloudRef> {
        self.check_provider(target)?;
        if artifact.path.is_dir() {
            return Err(BackupError::ConfigValidation(format!(
                "{} is a directory; compress it before uploading",
                artifact.path.display()
            )));
        }
        let key = match &target.key {
            Some(key) => key.clone(),
            None => {
                let name = artifact
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        BackupError::ConfigValidation(format!(
                            "{} has no file name",
                            artifact.path.display()
                        ))
                    })?;
                self.default_key(&name)
            }
        };

        let metadata = HashMap::from([
            (META_ENGINE.to_string(), artifact.engine.to_string()),
            (META_CHECKSUM.to_string(), artifact.checksum.clone()),
            (META_COMPRESSED.to_string(), artifact.compressed.to_string()),
            (META_CREATED_AT.to_string(), artifact.created_at.to_rfc3339()),
        ]);
        let remote = CloudRef::new(target.provider, target.bucket.clone(), Some(key.clone()));
        info!("Uploading {} to {remote}", artifact.path.display());
        self.provider
            .upload_file(
                &target.bucket,
                &key,
                &artifact.path,
                content_type_for(&artifact.path),
                Some(metadata),
            )
            .await?;
        info!("Uploaded {} bytes to {remote}", artifact.size_bytes);
        Ok(remote)
    }

    async fn download(
        &self,
        remote: &CloudRef,
        local_path: &Path,
        guard: &StepGuard,
    ) -> Result<Artifact> {
        self.check_provider(remote)?;
        let key = remote.key.as_deref().ok_or_else(|| {
            BackupError::ConfigValidation(format!("{remote} does not name an object"))
        })?;

        let object = self.provider.get_object_metadata(&remote.bucket, key).await?;
        let user = object.metadata.unwrap_or_default();
        debug!("Object metadata for {remote}: {user:?}");

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = with_suffix(local_path, ".partial");
        info!("Downloading {remote} to {}", local_path.display());
        if let Err(e) = self.provider.download_file(&remote.bucket, key, &partial).await {
            discard(&partial).await;
            return Err(e.into());
        }

        let expected = user.get(META_CHECKSUM).cloned();
        let engine_hint = match user.get(META_ENGINE) {
            Some(engine) => Some(engine.parse::<Engine>()?),
            None => None,
        };
        let created_at = user
            .get(META_CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let compressed_hint = user.get(META_COMPRESSED).is_some_and(|v| v == "true");

        let verify_path = partial.clone();
        let guard = guard.clone();
        let verified = tokio::task::spawn_blocking(move || {
            verify_and_describe(verify_path, expected, engine_hint, created_at, compressed_hint, guard)
        })
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e)))?;
        let artifact = match verified {
            Ok(artifact) => artifact,
            Err(e) => {
                discard(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, local_path).await?;
        info!(
            "Downloaded {remote} ({} bytes, {})",
            artifact.size_bytes, artifact.engine
        );
        Ok(Artifact {
            path: local_path.to_path_buf(),
            ..artifact
        })
    }
}
