use crate::{Metadata, ObjectMetadata, StorageError, StorageProvider};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{TimeZone, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

/// S3 requires every part except the last to be at least 5 MiB.
const PART_SIZE: usize = 5 * 1024 * 1024;

const GCS_INTEROP_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Aws,
    Minio,
    Gcs,
    Other(String),
}

pub struct S3Provider {
    /// S3 client
    client: Client,
    /// Region
    region: String,
    /// Custom endpoint
    endpoint: Option<String>,
    /// Provider kind (for provider-specific config/quirks)
    provider_kind: ProviderKind,
}

impl S3Provider {
    /// Creates a new S3 provider
    pub async fn new_with_kind(
        region: Option<String>,
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        provider_kind: ProviderKind,
    ) -> Result<Self, StorageError> {
        let region_str = region.unwrap_or_else(|| "us-east-1".to_string());
        info!("Initializing S3Provider for {provider_kind:?} in {region_str}");
        let region = Region::new(region_str.clone());

        // Retries are owned by the caller, so the SDK makes a single attempt.
        let mut config_builder = aws_config::defaults(BehaviorVersion::v2025_01_17())
            .region(region)
            .retry_config(aws_config::retry::RetryConfig::standard().with_max_attempts(1));

        // Add credentials if provided
        if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
            let credentials = aws_credential_types::Credentials::new(
                access_key, secret_key, None, None, "explicit",
            );
            config_builder =
                config_builder.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        // Provider-specific endpoint and config
        let mut force_path_style = false;
        let mut default_endpoint = endpoint;
        match provider_kind {
            ProviderKind::Aws => {}
            ProviderKind::Minio => {
                force_path_style = true;
                if default_endpoint.is_none() {
                    default_endpoint = Some("http://localhost:9000".to_string());
                }
            }
            ProviderKind::Gcs => {
                force_path_style = true;
                if default_endpoint.is_none() {
                    default_endpoint = Some(GCS_INTEROP_ENDPOINT.to_string());
                }
            }
            ProviderKind::Other(_) => {
                force_path_style = default_endpoint.is_some();
            }
        }
        if let Some(ref ep) = default_endpoint {
            info!("Using custom endpoint: {ep}");
            config_builder = config_builder.endpoint_url(ep.clone());
        }

        let sdk_config = config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        let client = Client::from_conf(s3_config_builder.build());
        Ok(Self {
            client,
            region: region_str,
            endpoint: default_endpoint,
            provider_kind,
        })
    }

    /// Helper: initiate a multipart upload and return the upload_id
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<String, StorageError> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key);
        if let Some(content_type) = content_type {
            req = req.content_type(content_type);
        }
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                req = req.metadata(k, v);
            }
        }
        let resp = req.send().await.map_err(|e| {
            error!("Failed to initiate multipart upload for {bucket}/{key}: {e}");
            StorageError::from_sdk(&e, "create_multipart_upload")
        })?;
        resp.upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Unexpected("No upload_id returned from S3".to_string()))
    }

    /// Best-effort abort so a failed upload does not leave billable parts behind.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!("Failed to abort multipart upload {upload_id} for {bucket}/{key}: {e}");
        }
    }

    /// Reads up to PART_SIZE bytes, returning fewer only at end of file.
    async fn fill_part<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, StorageError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await.map_err(|e| {
                error!("Failed to read file part: {e}");
                StorageError::Io(e)
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn upload_parts<R>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        reader: &mut R,
    ) -> Result<Vec<CompletedPart>, StorageError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut parts = Vec::new();
        let mut part_number = 1;
        let mut buf = vec![0u8; PART_SIZE];
        loop {
            let filled = Self::fill_part(reader, &mut buf).await?;
            if filled == 0 {
                break;
            }
            debug!("Uploading part {part_number} ({filled} bytes)");
            let upload_part_resp = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf[..filled].to_vec()))
                .send()
                .await
                .map_err(|e| {
                    error!("Failed to upload part {part_number} for {bucket}/{key}: {e:?}");
                    report_s3_error_to_sentry(
                        "upload_file:upload_part",
                        &e as &dyn std::error::Error,
                        bucket,
                        key,
                    );
                    StorageError::from_sdk(&e, "upload_part")
                })?;
            parts.push(
                CompletedPart::builder()
                    .set_part_number(Some(part_number))
                    .set_e_tag(upload_part_resp.e_tag().map(|s| s.to_string()))
                    .build(),
            );
            part_number += 1;
            if filled < PART_SIZE {
                break;
            }
        }
        Ok(parts)
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        match self.provider_kind {
            ProviderKind::Gcs => "Google Cloud Storage",
            ProviderKind::Minio => "MinIO",
            _ => "AWS S3",
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.bucket_exists(bucket).await? {
            info!("Bucket {bucket} already exists");
            return Ok(());
        }

        let mut req = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if matches!(self.provider_kind, ProviderKind::Aws) && self.region != "us-east-1" {
            req = req.create_bucket_configuration(
                aws_sdk_s3::types::CreateBucketConfiguration::builder()
                    .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(
                        self.region.as_str(),
                    ))
                    .build(),
            );
        }
        let created = req.send().await.map_err(|e| {
            error!("Failed to create bucket {bucket}: {e}");
            StorageError::from_sdk(&e, "create_bucket")
        })?;
        info!("Created bucket: {:?}", created.location());
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        debug!(
            "Checking if bucket {bucket} exists (region {}, endpoint {:?})",
            self.region, self.endpoint
        );
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => match StorageError::from_sdk(&e, "head_bucket") {
                StorageError::NotFound(_) => Ok(false),
                // A 403 means the bucket exists but belongs to someone else or we
                // lack ListBucket; uploads will surface the real permission error.
                StorageError::PermissionDenied(_) => Ok(true),
                other => {
                    error!("Error checking if bucket {bucket} exists: {other}");
                    Err(other)
                }
            },
        }
    }

    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        content_type: Option<&str>,
        metadata: Option<Metadata>,
    ) -> Result<(), StorageError> {
        let file = File::open(file_path).await.map_err(|e| {
            error!("Failed to open file {}: {}", file_path.display(), e);
            StorageError::Io(e)
        })?;
        let file_size = file.metadata().await.map_err(StorageError::Io)?.len();
        let mut reader = BufReader::new(file);

        // Use single put_object for small files
        if file_size <= PART_SIZE as u64 {
            let mut buffer = Vec::with_capacity(file_size as usize);
            reader.read_to_end(&mut buffer).await.map_err(|e| {
                error!("Failed to read file {}: {}", file_path.display(), e);
                StorageError::Io(e)
            })?;
            let mut put_object_request = self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(buffer));
            if let Some(content_type) = content_type {
                put_object_request = put_object_request.content_type(content_type);
            }
            if let Some(metadata) = metadata {
                for (key, value) in metadata {
                    put_object_request = put_object_request.metadata(key, value);
                }
            }
            put_object_request.send().await.map_err(|e| {
                error!("Failed to upload file to {bucket}/{key}: {e}");
                StorageError::from_sdk(&e, "put_object")
            })?;
            info!(
                "Uploaded file {} to {}/{} ({} bytes) in single part",
                file_path.display(),
                bucket,
                key,
                file_size
            );
            return Ok(());
        }

        debug!("Initiating multipart upload: bucket={bucket}, key={key}, file_size={file_size}");
        let upload_id = self
            .initiate_multipart_upload(bucket, key, content_type, metadata)
            .await?;
        let parts = match self.upload_parts(bucket, key, &upload_id, &mut reader).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart_upload(bucket, key, &upload_id).await;
                return Err(e);
            }
        };

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await;
        if let Err(e) = completed {
            error!("Failed to complete multipart upload for {bucket}/{key}: {e:?}");
            report_s3_error_to_sentry(
                "upload_file:complete_multipart_upload",
                &e as &dyn std::error::Error,
                bucket,
                key,
            );
            self.abort_multipart_upload(bucket, key, &upload_id).await;
            return Err(StorageError::from_sdk(&e, "complete_multipart_upload"));
        }
        info!("Multipart upload completed: {}/{}", bucket, key);
        Ok(())
    }

    async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to get object {bucket}/{key}: {e}");
                StorageError::from_sdk(&e, &format!("get_object {bucket}/{key}"))
            })?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(destination).await.map_err(|e| {
            error!("Failed to create file {}: {}", destination.display(), e);
            StorageError::Io(e)
        })?;
        let mut stream = resp.body.into_async_read();
        let bytes_written = tokio::io::copy(&mut stream, &mut file)
            .await
            .map_err(|e| StorageError::Unavailable(format!("download of {bucket}/{key} interrupted: {e}")))?;
        file.flush().await.map_err(StorageError::Io)?;
        file.sync_all().await.map_err(StorageError::Io)?;
        info!("Downloaded {bucket}/{key} to {} ({bytes_written} bytes)", destination.display());
        Ok(bytes_written)
    }

    async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectMetadata, StorageError> {
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk(&e, &format!("head_object {bucket}/{key}")))?;

        let last_modified = resp
            .last_modified()
            .and_then(|dt| Utc.timestamp_opt(dt.secs(), 0).single());
        let metadata = resp.metadata().filter(|m| !m.is_empty()).cloned();

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: resp.content_length().map(|s| s as u64),
            last_modified,
            etag: resp.e_tag().map(|s| s.to_string()),
            content_type: resp.content_type().map(|s| s.to_string()),
            metadata,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk(&e, &format!("delete_object {bucket}/{key}")))?;
        Ok(())
    }
}

fn report_s3_error_to_sentry(
    operation: &str,
    error: &dyn std::error::Error,
    bucket: &str,
    key: &str,
) {
    let mut extra = HashMap::new();
    extra.insert("bucket", bucket);
    extra.insert("key", key);

    let error_message = format!("{operation}: {error}");
    let extra_json = serde_json::to_string(&extra).unwrap_or_default();
    let sentry_message = format!("{error_message} | context: {extra_json}");
    sentry::capture_message(&sentry_message, sentry::Level::Error);
}
