//! Content-addressed uploads
//!
//! Files are stored under `prefix/<sha256>.<ext>`, so identical bytes always
//! land on the same key and are only ever uploaded once.

use crate::models::{RemoteKey, UploadOutcome};
use crate::sniff::{self, ImageType};
use crate::store::{BlobStore, PutOptions};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Uploader {
    store: Arc<dyn BlobStore>,
    cache_control: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn BlobStore>, cache_control: String) -> Self {
        Self {
            store,
            cache_control,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Upload `local_path` under `dest_prefix` unless its content is already
    /// present. The key extension is the canonical one for `content_type`,
    /// falling back to the file's own extension for unknown types.
    pub async fn upload(
        &self,
        local_path: &Path,
        dest_prefix: &str,
        content_type: &str,
    ) -> Result<UploadOutcome> {
        let digest = sniff::digest(local_path).await?;
        let extension = ImageType::from_mime(content_type)
            .map(|kind| kind.extension().to_string())
            .or_else(|| {
                local_path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(str::to_string)
            });
        let key = RemoteKey::new(dest_prefix, &digest, extension.as_deref());

        if let Some(existing) = self.store.head_object(key.as_str()).await? {
            info!("{} already stored, skipping upload", key);
            return Ok(UploadOutcome::AlreadyExists {
                key,
                digest: existing.digest,
            });
        }

        let options = PutOptions {
            content_type: content_type.to_string(),
            cache_control: self.cache_control.clone(),
            digest: digest.clone(),
        };
        self.store
            .put_object(local_path, key.as_str(), &options)
            .await?;
        info!("Uploaded {}", key);

        Ok(UploadOutcome::Created { key, digest })
    }
}
