use super::{BlobStore, ObjectMetadata, PutOptions, DIGEST_METADATA_KEY};
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{config::Region, types::ObjectCannedAcl, Client as S3Client};
use std::path::Path;
use tokio_retry::{strategy::FixedInterval, Retry};
use tracing::{debug, warn};

const PUT_RETRY_INTERVAL_MS: u64 = 500;
const PUT_RETRIES: usize = 2;

pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    base_url: String,
}

impl S3BlobStore {
    pub async fn new(
        access_key_id: String,
        secret_access_key: String,
        endpoint: String,
        bucket: String,
        base_url: String,
    ) -> Result<Self> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "digital-ocean-spaces",
        );

        // Custom config for DigitalOcean Spaces
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1")) // Spaces ignores the region
            .endpoint_url(endpoint)
            .load()
            .await;

        let client = S3Client::new(&config);

        Ok(Self {
            client,
            bucket,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn put_once(&self, local_path: &Path, key: &str, options: &PutOptions) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| Error::StoreFailed(format!("Failed to read {}: {}", local_path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(&options.content_type)
            .cache_control(&options.cache_control)
            .metadata(DIGEST_METADATA_KEY, &options.digest)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| Error::StoreFailed(format!("Failed to upload {}: {}", key, e)))?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    debug!("No object at {}", key);
                    return Ok(None);
                }
                return Err(Error::StoreFailed(format!("Failed to stat {}: {}", key, e)));
            }
        };

        // Objects written outside this service may lack the digest metadata;
        // the ETag then stands in and will not match a SHA-256.
        let digest = output
            .metadata()
            .and_then(|meta| meta.get(DIGEST_METADATA_KEY))
            .cloned()
            .or_else(|| output.e_tag().map(|tag| tag.trim_matches('"').to_string()))
            .unwrap_or_default();

        Ok(Some(ObjectMetadata {
            key: key.to_string(),
            digest,
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|len| u64::try_from(len).ok()),
        }))
    }

    async fn put_object(
        &self,
        local_path: &Path,
        key: &str,
        options: &PutOptions,
    ) -> Result<ObjectMetadata> {
        let strategy = FixedInterval::from_millis(PUT_RETRY_INTERVAL_MS).take(PUT_RETRIES);

        Retry::spawn(strategy, || async {
            self.put_once(local_path, key, options).await.map_err(|e| {
                warn!("Upload attempt for {} failed: {}", key, e);
                e
            })
        })
        .await?;

        let content_length = tokio::fs::metadata(local_path).await.ok().map(|m| m.len());

        Ok(ObjectMetadata {
            key: key.to_string(),
            digest: options.digest.clone(),
            content_type: Some(options.content_type.clone()),
            content_length,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
