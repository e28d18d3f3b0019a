//! Flat key-value client for the S3-compatible object store: `images/<id>.qcow2`
//! blobs travel through `put`/`get`/`head` only, never a richer S3 feature.

use anyhow::Context;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use futures_util::TryStreamExt;

use crate::config::{S3_ACCESS_KEY, S3_BUCKET, S3_ENDPOINT, S3_SECRET_KEY};

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    pub async fn connect() -> Self {
        let credentials = Credentials::new(
            S3_ACCESS_KEY.as_str(),
            S3_SECRET_KEY.as_str(),
            None,
            None,
            "zeitwork",
        );
        let config = aws_sdk_s3::Config::builder()
            .region(Region::new("us-east-1"))
            .endpoint_url(S3_ENDPOINT.as_str())
            .credentials_provider(credentials)
            .force_path_style(true)
            .behavior_version_latest()
            .build();
        Self { client: Client::from_conf(config), bucket: S3_BUCKET.clone() }
    }

    pub async fn put_file(&self, key: &str, path: &std::path::Path) -> anyhow::Result<()> {
        let body = ByteStream::from_path(path).await.context("reading local file for upload")?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .context("s3 put_object failed")?;
        Ok(())
    }

    pub async fn get_to_file(&self, key: &str, path: &std::path::Path) -> anyhow::Result<()> {
        let mut output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 get_object failed")?;
        let mut file = tokio::fs::File::create(path).await.context("creating local destination file")?;
        while let Some(chunk) = output.body.try_next().await.context("reading s3 response body")? {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(anyhow::anyhow!("s3 head_object failed: {e}"))
                }
            }
        }
    }
}
