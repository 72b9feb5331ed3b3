//! Object storage for backup artifacts.
//!
//! A single [`StorageProvider`] interface covers the three supported backends:
//! AWS S3 (and S3-compatible stores such as MinIO), Google Cloud Storage through
//! its S3 interoperability endpoint, and Azure Blob Storage. Uploads and downloads
//! stream through fixed-size parts so memory use does not grow with object size.

mod error;
pub mod providers;
mod types;

pub use error::StorageError;
pub use providers::*;
pub use types::*;

use async_trait::async_trait;
use std::path::Path;

/// Core storage provider interface.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Returns the name of the storage provider.
    fn name(&self) -> &str;

    /// Creates a new bucket (container) if it doesn't exist.
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Checks if a bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Uploads a file to the storage provider.
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        content_type: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<(), StorageError>;

    /// Downloads an object to a file.
    async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<u64, StorageError>;

    /// Gets metadata for an object.
    async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectMetadata, StorageError>;

    /// Deletes an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Checks if an object exists.
    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.get_object_metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Factory for creating storage providers.
pub struct StorageProviderFactory;

impl StorageProviderFactory {
    pub async fn create(config: &StorageConfig) -> Result<Box<dyn StorageProvider>, StorageError> {
        match config.provider {
            StorageProviderType::S3 => {
                let kind = if config.endpoint.is_some() {
                    ProviderKind::Minio
                } else {
                    ProviderKind::Aws
                };
                let provider = S3Provider::new_with_kind(
                    config.region.clone(),
                    config.endpoint.clone(),
                    config.access_key.clone(),
                    config.secret_key.clone(),
                    kind,
                )
                .await?;
                Ok(Box::new(provider))
            }
            StorageProviderType::Gcs => {
                let provider = S3Provider::new_with_kind(
                    config.region.clone().or_else(|| Some("auto".to_string())),
                    config.endpoint.clone(),
                    config.access_key.clone(),
                    config.secret_key.clone(),
                    ProviderKind::Gcs,
                )
                .await?;
                Ok(Box::new(provider))
            }
            StorageProviderType::Azure => {
                let provider = AzureBlobProvider::new(
                    config.account.clone(),
                    config.endpoint.clone(),
                    config.sas_token.clone(),
                )?;
                Ok(Box::new(provider))
            }
        }
    }
}

/// Content type used for an artifact file, judged by its extension.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("sql") => Some("text/plain"),
        Some("archive") | Some("gz") => Some("application/gzip"),
        Some("tar") => Some("application/x-tar"),
        Some("dump") | Some("db") | Some("bak") => Some("application/octet-stream"),
        _ => None,
    }
}
