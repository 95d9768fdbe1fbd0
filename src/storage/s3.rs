// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO, ...).
use super::StorageBackend;
use crate::config::Timeouts;
use crate::errors::{AppError, Result};
use crate::models::Destination;
use crate::vault::Vault;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: String,
    region: String,
    timeouts: Timeouts,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .finish()
    }
}

impl S3Storage {
    /// Builds a client for `destination`. Credentials are decrypted here and
    /// handed to the SDK; nothing else keeps the plaintext.
    pub async fn from_destination(destination: &Destination, vault: &Vault, timeouts: Timeouts) -> Result<Self> {
        let access_key_id = vault.decrypt_string(&destination.encrypted_access_key_id)?;
        let secret_access_key = vault.decrypt_string(&destination.encrypted_secret_access_key)?;

        if !destination.verify_ssl {
            warn!(
                destination = %destination.name,
                "verify_ssl=false is not supported by the S3 client; certificates will still be verified"
            );
        }

        let region = match destination.region.trim() {
            "" => DEFAULT_REGION.to_string(),
            region => region.to_string(),
        };
        let endpoint = normalize_endpoint(&destination.endpoint_url, destination.use_ssl)?;

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(Credentials::new(
                access_key_id.as_str(),
                secret_access_key.as_str(),
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        let mut builder = s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = s3::Client::from_conf(builder.build());

        debug!(
            destination = %destination.name,
            bucket = %destination.bucket_name,
            endpoint = endpoint.as_deref().unwrap_or("aws"),
            region = %region,
            "S3 client ready"
        );

        Ok(Self {
            client,
            bucket: destination.bucket_name.clone(),
            prefix: destination.path_prefix.trim_matches('/').to_string(),
            region,
            timeouts,
        })
    }

    fn key_for(&self, name: &str) -> String {
        object_key(&self.prefix, name)
    }

    /// HeadBucket; a NotFound answer is `Ok(false)`, anything else an error.
    pub async fn bucket_exists(&self) -> Result<bool> {
        let result = bounded(
            self.timeouts.s3_metadata,
            "HeadBucket",
            self.client.head_bucket().bucket(&self.bucket).send(),
        )
        .await?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(sdk_failure("check bucket", &self.bucket, e)),
        }
    }

    pub async fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        bounded(self.timeouts.s3_metadata, "CreateBucket", request.send())
            .await?
            .map_err(|e| sdk_failure("create bucket", &self.bucket, e))?;
        info!(bucket = %self.bucket, region = %self.region, "Created bucket");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, local_path: &Path) -> Result<()> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Validation(format!("Not a file path: {}", local_path.display())))?;
        let key = self.key_for(name);

        info!(file = %local_path.display(), bucket = %self.bucket, key = %key, "Uploading snapshot");

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read {}: {}", local_path.display(), e)))?;

        bounded(
            self.timeouts.s3_upload,
            "PutObject",
            self.client.put_object().bucket(&self.bucket).key(&key).body(body).send(),
        )
        .await?
        .map_err(|e| sdk_failure("upload", &key, e))?;

        info!(bucket = %self.bucket, key = %key, "Upload complete");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let listing = async {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(format!("{}/", self.prefix));
            }
            let mut pages = request.into_paginator().send();

            let mut names = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| sdk_failure("list", &self.bucket, e))?;
                for object in page.contents() {
                    if let Some(name) = object.key().and_then(|key| strip_prefix(&self.prefix, key)) {
                        names.push(name.to_string());
                    }
                }
            }
            Ok::<_, AppError>(names)
        };

        let mut names = bounded(self.timeouts.s3_metadata, "ListObjectsV2", listing).await??;
        names.sort();
        Ok(names)
    }

    async fn download(&self, name: &str, dest_path: &Path) -> Result<()> {
        let key = self.key_for(name);
        info!(bucket = %self.bucket, key = %key, dest = %dest_path.display(), "Downloading snapshot");

        let transfer = async {
            let mut object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                        AppError::not_found("backup", name)
                    } else {
                        sdk_failure("download", &key, e)
                    }
                })?;

            let mut output = tokio::fs::File::create(dest_path).await?;
            let mut total_bytes: usize = 0;
            while let Some(chunk) = object
                .body
                .try_next()
                .await
                .map_err(|e| AppError::Storage(format!("Failed reading {}: {}", key, e)))?
            {
                output.write_all(&chunk).await?;
                total_bytes += chunk.len();
            }
            output.flush().await?;
            Ok::<_, AppError>(total_bytes)
        };

        let total_bytes = bounded(self.timeouts.s3_download, "GetObject", transfer).await??;
        info!(key = %key, bytes = total_bytes, "Download complete");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let key = self.key_for(name);
        bounded(
            self.timeouts.s3_metadata,
            "DeleteObject",
            self.client.delete_object().bucket(&self.bucket).key(&key).send(),
        )
        .await?
        .map_err(|e| sdk_failure("delete", &key, e))?;
        info!(bucket = %self.bucket, key = %key, "Deleted snapshot");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let key = self.key_for(name);
        let result = bounded(
            self.timeouts.s3_metadata,
            "HeadObject",
            self.client.head_object().bucket(&self.bucket).key(&key).send(),
        )
        .await?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(sdk_failure("stat", &key, e)),
        }
    }

    async fn test_connection(&self) -> bool {
        let probe = self.client.list_objects_v2().bucket(&self.bucket).max_keys(1).send();
        match timeout(self.timeouts.s3_probe, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(bucket = %self.bucket, error = %DisplayErrorContext(&e), "S3 probe failed");
                false
            }
            Err(_) => {
                warn!(bucket = %self.bucket, timeout_secs = self.timeouts.s3_probe.as_secs(), "S3 probe timed out");
                false
            }
        }
    }
}

async fn bounded<F: Future>(limit: Duration, operation: &str, fut: F) -> Result<F::Output> {
    timeout(limit, fut).await.map_err(|_| {
        AppError::Connectivity(format!("{} timed out after {}s", operation, limit.as_secs()))
    })
}

fn sdk_failure<E: std::error::Error>(action: &str, subject: &str, err: E) -> AppError {
    AppError::Storage(format!("Failed to {} {}: {}", action, subject, DisplayErrorContext(&err)))
}

/// Empty endpoint means AWS proper. A bare host gets a scheme from `use_ssl`.
pub fn normalize_endpoint(raw: &str, use_ssl: bool) -> Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{}://{}", if use_ssl { "https" } else { "http" }, raw)
    };
    let parsed = Url::parse(&candidate)
        .map_err(|e| AppError::Validation(format!("Invalid endpoint URL '{}': {}", raw, e)))?;
    if parsed.host_str().is_none() {
        return Err(AppError::Validation(format!("Endpoint URL '{}' has no host", raw)));
    }
    Ok(Some(parsed.as_str().trim_end_matches('/').to_string()))
}

pub fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

// Keys outside the prefix, or nested below it, are not snapshots of ours.
fn strip_prefix<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let name = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    if name.is_empty() || name.contains('/') {
        None
    } else {
        Some(name)
    }
}
