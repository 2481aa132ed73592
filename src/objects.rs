//! MinIO object-store client for attachment blobs.
//!
//! MinIO speaks the S3 API, so this is a thin wrapper over the AWS SDK
//! client with path-style addressing and root credentials.

use anyhow::{Context, Result};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use tracing::info;

use crate::config::MinioConfig;

#[derive(Clone)]
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl ObjectStore {
    pub fn connect(config: &MinioConfig) -> Self {
        let credentials = Credentials::new(
            config.root_user.clone(),
            config.root_password.clone(),
            None,
            None,
            "minio",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .force_path_style(true)
            .build();

        ObjectStore {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Verify the bucket is reachable. Bootstrap-fatal on failure.
    pub async fn healthcheck(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(self.bucket.clone())
            .send()
            .await
            .with_context(|| format!("object-store bucket {:?} unreachable", self.bucket))?;
        info!(bucket = %self.bucket, "object_store_ready");
        Ok(())
    }

    /// Bulk-delete blobs by key. Returns the number of keys submitted.
    pub async fn delete_all(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let objects = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key.clone())
                    .build()
                    .context("invalid object key")
            })
            .collect::<Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .context("failed to build delete request")?;

        self.client
            .delete_objects()
            .bucket(self.bucket.clone())
            .delete(delete)
            .send()
            .await
            .context("bulk delete failed")?;

        Ok(keys.len())
    }
}
