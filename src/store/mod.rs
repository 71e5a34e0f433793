//! Remote blob store integration
//!
//! A thin key/value contract over S3-compatible storage (DigitalOcean
//! Spaces). Each object carries the SHA-256 of its content in user metadata,
//! which the uploader and generation cache treat as authoritative.

pub mod client;
pub mod mock;

pub use client::S3BlobStore;
pub use mock::MockBlobStore;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// User-metadata key holding the content digest.
pub const DIGEST_METADATA_KEY: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub digest: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: String,
    pub cache_control: String,
    pub digest: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the key does not exist; any other failure is an error.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;
    async fn put_object(
        &self,
        local_path: &Path,
        key: &str,
        options: &PutOptions,
    ) -> Result<ObjectMetadata>;
    fn public_url(&self, key: &str) -> String;
}
