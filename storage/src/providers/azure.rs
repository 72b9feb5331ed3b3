use crate::{Metadata, ObjectMetadata, StorageError, StorageProvider};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info};
use reqwest::{Client, Method, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

const API_VERSION: &str = "2021-08-06";
const BLOCK_SIZE: usize = 4 * 1024 * 1024;
const META_PREFIX: &str = "x-ms-meta-";

/// Azure Blob Storage over the REST API, authorised with a SAS token.
/// Buckets map to containers.
pub struct AzureBlobProvider {
    client: Client,
    base_url: Url,
    sas_token: Option<String>,
}

impl AzureBlobProvider {
    pub fn new(
        account: Option<String>,
        endpoint: Option<String>,
        sas_token: Option<String>,
    ) -> Result<Self, StorageError> {
        let base = match (endpoint, account) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("https://{account}.blob.core.windows.net"),
            (None, None) => {
                return Err(StorageError::Configuration(
                    "Azure storage needs an account name or an endpoint".to_string(),
                ))
            }
        };
        let base_url = Url::parse(&base)
            .map_err(|e| StorageError::Configuration(format!("invalid Azure endpoint {base}: {e}")))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        info!("Initializing AzureBlobProvider for {base_url}");
        Ok(Self {
            client,
            base_url,
            sas_token: sas_token.map(|t| t.trim_start_matches('?').to_string()),
        })
    }

    fn url(&self, container: &str, key: Option<&str>, query: &[(&str, &str)]) -> Result<Url, StorageError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                StorageError::Configuration(format!("endpoint {} cannot hold a path", self.base_url))
            })?;
            segments.pop_if_empty().push(container);
            if let Some(key) = key {
                for part in key.split('/').filter(|p| !p.is_empty()) {
                    segments.push(part);
                }
            }
        }
        url.set_query(self.sas_token.as_deref());
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
    }

    async fn check(resp: Response, context: &str) -> Result<Response, StorageError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!("{context} failed with {status}: {body}");
        Err(StorageError::from_status(
            status.as_u16(),
            format!("{context}: {status}"),
        ))
    }

    async fn put_block(
        &self,
        container: &str,
        key: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let url = self.url(container, Some(key), &[("comp", "block"), ("blockid", block_id)])?;
        let resp = self.request(Method::PUT, url).body(data).send().await?;
        Self::check(resp, &format!("put block {container}/{key}")).await?;
        Ok(())
    }
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

#[async_trait]
impl StorageProvider for AzureBlobProvider {
    fn name(&self) -> &str {
        "Azure Blob Storage"
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let url = self.url(bucket, None, &[("restype", "container")])?;
        let resp = self.request(Method::PUT, url).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            info!("Container {bucket} already exists");
            return Ok(());
        }
        Self::check(resp, &format!("create container {bucket}")).await?;
        info!("Created container {bucket}");
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let url = self.url(bucket, None, &[("restype", "container")])?;
        let resp = self.request(Method::HEAD, url).send().await?;
        match Self::check(resp, &format!("container properties {bucket}")).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
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
        let mut file = File::open(file_path).await.map_err(|e| {
            error!("Failed to open file {}: {}", file_path.display(), e);
            StorageError::Io(e)
        })?;

        let mut block_ids = Vec::new();
        let mut uploaded = 0u64;
        loop {
            let mut buf = vec![0u8; BLOCK_SIZE];
            let mut filled = 0;
            while filled < BLOCK_SIZE {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);
            // Block ids must all have the same length before encoding
            let block_id = STANDARD.encode(format!("block-{:08}", block_ids.len()));
            self.put_block(bucket, key, &block_id, Bytes::from(buf)).await?;
            block_ids.push(block_id);
            uploaded += filled as u64;
            if filled < BLOCK_SIZE {
                break;
            }
        }

        let url = self.url(bucket, Some(key), &[("comp", "blocklist")])?;
        let mut req = self
            .request(Method::PUT, url)
            .header("content-type", "application/xml")
            .body(block_list_xml(&block_ids));
        if let Some(content_type) = content_type {
            req = req.header("x-ms-blob-content-type", content_type);
        }
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                req = req.header(format!("{META_PREFIX}{k}"), v);
            }
        }
        let resp = req.send().await?;
        Self::check(resp, &format!("put block list {bucket}/{key}")).await?;
        info!(
            "Uploaded file {} to {}/{} ({} bytes in {} blocks)",
            file_path.display(),
            bucket,
            key,
            uploaded,
            block_ids.len()
        );
        Ok(())
    }

    async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StorageError> {
        let url = self.url(bucket, Some(key), &[])?;
        let resp = self.request(Method::GET, url).send().await?;
        let resp = Self::check(resp, &format!("get blob {bucket}/{key}")).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(destination).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::Unavailable(format!("download of {bucket}/{key} interrupted: {e}"))
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        info!("Downloaded {bucket}/{key} to {} ({written} bytes)", destination.display());
        Ok(written)
    }

    async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectMetadata, StorageError> {
        let url = self.url(bucket, Some(key), &[])?;
        let resp = self.request(Method::HEAD, url).send().await?;
        let resp = Self::check(resp, &format!("blob properties {bucket}/{key}")).await?;
        let headers = resp.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };

        let metadata: Metadata = headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().strip_prefix(META_PREFIX)?;
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: header("content-length").and_then(|s| s.parse().ok()),
            last_modified: header("last-modified")
                .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            etag: header("etag"),
            content_type: header("content-type"),
            metadata: if metadata.is_empty() { None } else { Some(metadata) },
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let url = self.url(bucket, Some(key), &[])?;
        let resp = self.request(Method::DELETE, url).send().await?;
        Self::check(resp, &format!("delete blob {bucket}/{key}")).await?;
        Ok(())
    }
}
