use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::StorageError;

/// Represents metadata for an object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Key (path) of the object
    pub key: String,
    /// Size of the object in bytes
    pub size: Option<u64>,
    /// Last modified time
    pub last_modified: Option<DateTime<Utc>>,
    /// ETag of the object
    pub etag: Option<String>,
    /// Content type of the object
    pub content_type: Option<String>,
    /// Custom metadata
    pub metadata: Option<Metadata>,
}

/// Custom metadata for objects
pub type Metadata = HashMap<String, String>;

/// Storage provider configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Provider type
    pub provider: StorageProviderType,
    /// Region for the provider
    pub region: Option<String>,
    /// Custom endpoint URL
    pub endpoint: Option<String>,
    /// Access key ID (S3, GCS HMAC)
    pub access_key: Option<String>,
    /// Secret access key (S3, GCS HMAC)
    pub secret_key: Option<String>,
    /// Storage account name (Azure)
    pub account: Option<String>,
    /// Shared access signature (Azure)
    pub sas_token: Option<String>,
}

impl StorageConfig {
    pub fn new(provider: StorageProviderType) -> Self {
        Self {
            provider,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            account: None,
            sas_token: None,
        }
    }
}

/// Supported storage provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProviderType {
    /// Amazon S3 and S3-compatible stores
    S3,
    /// Google Cloud Storage (S3 interoperability API)
    Gcs,
    /// Azure Blob Storage
    Azure,
}

impl StorageProviderType {
    /// URI scheme used when rendering object references.
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageProviderType::S3 => "s3",
            StorageProviderType::Gcs => "gs",
            StorageProviderType::Azure => "azure",
        }
    }
}

impl fmt::Display for StorageProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageProviderType::S3 => "s3",
            StorageProviderType::Gcs => "gcs",
            StorageProviderType::Azure => "azure",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageProviderType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageProviderType::S3),
            "gcs" | "gs" => Ok(StorageProviderType::Gcs),
            "azure" => Ok(StorageProviderType::Azure),
            other => Err(StorageError::Configuration(format!(
                "unknown storage provider: {other}"
            ))),
        }
    }
}
