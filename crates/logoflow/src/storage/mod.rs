use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// Durable object storage with time-limited signed URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `body` under `key` and returns its location.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        size: u64,
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn signed_put_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn signed_get_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Object path for a job's original upload. Same id and name, same key.
pub fn storage_key(job_id: Uuid, file_name: &str) -> String {
    format!("original/{}/{}", job_id, sanitize_file_name(file_name))
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "logoflow-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "storage client initialized");

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    fn presigning(ttl: Duration) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(ttl)
            .context("invalid presigning window")
            .map_err(StorageError::from)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, body))]
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        size: u64,
        content_type: &str,
    ) -> Result<String, StorageError> {
        debug!("uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("failed to upload {key}"))?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    #[instrument(skip(self))]
    async fn signed_put_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .with_context(|| format!("failed to presign upload for {key}"))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn signed_get_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presigning(ttl)?)
            .await
            .with_context(|| format!("failed to presign download for {key}"))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to delete {key}"))?;

        info!("deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }
}
