use super::{BlobStore, ObjectMetadata, PutOptions};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    metadata: ObjectMetadata,
    bytes: Vec<u8>,
}

/// In-memory blob store used for dry runs and tests.
#[derive(Clone)]
pub struct MockBlobStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    base_url: String,
    head_count: Arc<Mutex<usize>>,
    put_count: Arc<Mutex<usize>>,
    latency: Option<Duration>,
    fail_puts: Arc<Mutex<bool>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            base_url: "https://mock-cdn.example.com".to_string(),
            head_count: Arc::new(Mutex::new(0)),
            put_count: Arc::new(Mutex::new(0)),
            latency: None,
            fail_puts: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Delay every store call, to make concurrent completion order observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_object(self, key: &str, digest: &str, bytes: Vec<u8>) -> Self {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                metadata: ObjectMetadata {
                    key: key.to_string(),
                    digest: digest.to_string(),
                    content_type: None,
                    content_length: Some(bytes.len() as u64),
                },
                bytes,
            },
        );
        self
    }

    pub fn with_put_failure(self, fail: bool) -> Self {
        *self.fail_puts.lock().unwrap() = fail;
        self
    }

    /// Simulates an out-of-band delete.
    pub fn remove_object(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    /// Simulates an out-of-band overwrite with different content.
    pub fn overwrite_digest(&self, key: &str, digest: &str) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            object.metadata.digest = digest.to_string();
        }
    }

    pub fn get_head_count(&self) -> usize {
        *self.head_count.lock().unwrap()
    }

    pub fn get_put_count(&self) -> usize {
        *self.put_count.lock().unwrap()
    }

    pub fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.bytes.clone())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        *self.head_count.lock().unwrap() += 1;
        self.simulate_latency().await;

        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.metadata.clone()))
    }

    async fn put_object(
        &self,
        local_path: &Path,
        key: &str,
        options: &PutOptions,
    ) -> Result<ObjectMetadata> {
        *self.put_count.lock().unwrap() += 1;
        self.simulate_latency().await;

        if *self.fail_puts.lock().unwrap() {
            return Err(Error::StoreFailed(format!("Mock put failure for {}", key)));
        }

        let bytes = tokio::fs::read(local_path).await?;
        let metadata = ObjectMetadata {
            key: key.to_string(),
            digest: options.digest.clone(),
            content_type: Some(options.content_type.clone()),
            content_length: Some(bytes.len() as u64),
        };

        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                metadata: metadata.clone(),
                bytes,
            },
        );
        Ok(metadata)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
