// sitesnap/src/storage/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{Disk, remote_join};

/// S3 or any S3-compatible object store (Spaces, MinIO, R2, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3DiskConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub use_path_style_endpoint: bool,
    #[serde(default)]
    pub root: Option<String>,
}

pub struct S3Disk {
    name: String,
    client: s3::Client,
    bucket: String,
    root: Option<String>,
}

impl S3Disk {
    pub async fn connect(name: &str, cfg: &S3DiskConfig) -> Result<Self> {
        if cfg.bucket.trim().is_empty() {
            anyhow::bail!("S3 bucket must be set");
        }
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &cfg.access_key_id,
                &cfg.secret_access_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = cfg.endpoint.as_deref().filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.use_path_style_endpoint)
            .build();

        Ok(S3Disk {
            name: name.to_string(),
            client: s3::Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
            root: cfg.root.clone(),
        })
    }

    fn key(&self, remote_path: &str) -> String {
        remote_join(self.root.as_deref(), remote_path)
    }
}

#[async_trait]
impl Disk for S3Disk {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, remote_path: &str, source: &Path) -> Result<()> {
        let key = self.key(remote_path);
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", source.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    source.display(),
                    self.bucket,
                    key
                )
            })?;
        info!(disk = %self.name, bucket = %self.bucket, key = %key, "Uploaded to S3");
        Ok(())
    }

    async fn get_file(&self, remote_path: &str, dest: &Path) -> Result<()> {
        let key = self.key(remote_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory for download: {}", parent.display()))?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to get object s3://{}/{}", self.bucket, key))?;

        let mut output_file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create destination file: {}", dest.display()))?;
        let mut total_bytes = 0usize;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .with_context(|| format!("Failed to read object s3://{}/{}", self.bucket, key))?
        {
            output_file
                .write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write to destination file: {}", dest.display()))?;
            total_bytes += chunk.len();
        }
        output_file.flush().await?;

        info!(disk = %self.name, key = %key, bytes = total_bytes, "Downloaded from S3");
        Ok(())
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let key = self.key(remote_path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to delete object s3://{}/{}", self.bucket, key))?;
        Ok(())
    }
}
