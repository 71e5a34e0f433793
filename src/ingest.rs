//! Upload orchestration
//!
//! Fans a batch of local files (or one remote URL) out to the uploader. Each
//! item settles on its own, its scratch file is removed as soon as its
//! outcome is known, and results come back in request order.

use crate::batch::{AssetRef, BatchItemResult, BatchResult, ItemFailure};
use crate::error::SizePhase;
use crate::fetch::Fetcher;
use crate::scratch::TempArtifact;
use crate::sniff::{self, ImageType};
use crate::uploader::Uploader;
use crate::{Error, Result};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A file already written to scratch storage by the transport layer.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub path: PathBuf,
    pub original_name: Option<String>,
    /// Set when the transport stopped writing at its size limit.
    pub truncated: bool,
}

impl IncomingFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            original_name: None,
            truncated: false,
        }
    }

    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn identifier(&self) -> String {
        self.original_name
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub struct UploadOrchestrator {
    uploader: Arc<Uploader>,
    fetcher: Fetcher,
    dest_prefix: String,
    max_bytes: u64,
    fetch_deadline: Duration,
}

impl UploadOrchestrator {
    pub fn new(
        uploader: Arc<Uploader>,
        fetcher: Fetcher,
        dest_prefix: String,
        max_bytes: u64,
        fetch_deadline: Duration,
    ) -> Self {
        Self {
            uploader,
            fetcher,
            dest_prefix,
            max_bytes,
            fetch_deadline,
        }
    }

    pub async fn upload_batch(&self, items: Vec<IncomingFile>) -> BatchResult {
        info!("Uploading batch of {} file(s)", items.len());
        let results = join_all(items.into_iter().map(|item| self.upload_item(item))).await;
        BatchResult::from_items(results)
    }

    async fn upload_item(&self, item: IncomingFile) -> BatchItemResult {
        let identifier = item.identifier();
        let artifact = TempArtifact::adopt(item.path);

        let outcome = self.store_file(artifact.path(), item.truncated).await;
        artifact.remove().await;

        match outcome {
            Ok(asset) => BatchItemResult::success(identifier, asset),
            Err(e) => {
                warn!("[{}] Upload rejected: {}", identifier, e);
                BatchItemResult::from_error(identifier, &e)
            }
        }
    }

    pub async fn import_by_url(&self, uri: &str) -> BatchItemResult {
        let fetched = match self
            .fetcher
            .fetch(uri, self.max_bytes, self.fetch_deadline)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("[{}] Import fetch failed: {}", uri, e);
                return BatchItemResult::failure(
                    uri,
                    ItemFailure::from_error(&e).with_code(fetch_failure_code(&e)),
                );
            }
        };

        let outcome = self.store_file(fetched.artifact.path(), false).await;
        fetched.artifact.remove().await;

        match outcome {
            Ok(asset) => {
                info!(
                    "[{}] Imported {} ({} bytes) as {}",
                    uri,
                    fetched.source_name.as_deref().unwrap_or("remote file"),
                    fetched.bytes,
                    asset.key
                );
                BatchItemResult::success(uri, asset)
            }
            Err(e) => {
                warn!("[{}] Import rejected: {}", uri, e);
                BatchItemResult::failure(
                    uri,
                    ItemFailure::from_error(&e).with_code(store_failure_code(&e)),
                )
            }
        }
    }

    async fn store_file(&self, path: &Path, truncated: bool) -> Result<AssetRef> {
        let kind = accepted_type(path).await?;

        if truncated {
            return Err(Error::TooLarge {
                phase: SizePhase::Streamed,
                limit: self.max_bytes,
            });
        }

        let outcome = self
            .uploader
            .upload(path, &self.dest_prefix, kind.mime())
            .await?;
        let url = self.uploader.store().public_url(outcome.key().as_str());
        Ok(AssetRef::from_outcome(&outcome, url))
    }
}

async fn accepted_type(path: &Path) -> Result<ImageType> {
    match sniff::sniff_type(path).await? {
        Some(kind) if kind.is_web_safe() => Ok(kind),
        Some(kind) => Err(Error::UnsupportedType(kind.mime().to_string())),
        None => Err(Error::UnsupportedType("unrecognised content".to_string())),
    }
}

fn fetch_failure_code(error: &Error) -> &'static str {
    match error {
        Error::InvalidInput(_) => "IMPORT_INVALID_URL",
        Error::TooLarge {
            phase: SizePhase::Claimed,
            ..
        } => "IMPORT_HEAD_TOO_LARGE",
        Error::TooLarge {
            phase: SizePhase::Streamed,
            ..
        } => "IMPORT_STREAM_TOO_LARGE",
        Error::Timeout(_) => "IMPORT_TIMEOUT",
        _ => "IMPORT_FETCH_FAILED",
    }
}

fn store_failure_code(error: &Error) -> &'static str {
    match error {
        Error::UnsupportedType(_) => "IMPORT_UNSUPPORTED_TYPE",
        _ => "IMPORT_UPLOAD_FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Disposition, StatusClass};
    use crate::error::ErrorKind;
    use crate::scratch::Scratch;
    use crate::store::MockBlobStore;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x01];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    async fn orchestrator(store: &MockBlobStore, max_bytes: u64) -> (UploadOrchestrator, TempDir) {
        let dir = tempdir().unwrap();
        let scratch = Scratch::new(&dir.path().join("fetch")).await.unwrap();
        let uploader = Arc::new(Uploader::new(Arc::new(store.clone()), "public".to_string()));
        let fetcher = Fetcher::new(scratch, Duration::from_secs(2)).unwrap();
        (
            UploadOrchestrator::new(
                uploader,
                fetcher,
                "uploads".to_string(),
                max_bytes,
                Duration::from_secs(5),
            ),
            dir,
        )
    }

    fn incoming(dir: &TempDir, name: &str, bytes: &[u8]) -> IncomingFile {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        IncomingFile::new(path).with_original_name(name)
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_cleans_up() {
        let store = MockBlobStore::new().with_latency(Duration::from_millis(100));
        let (orchestrator, dir) = orchestrator(&store, 1024).await;

        let a = incoming(&dir, "a.png", PNG);
        let b = incoming(&dir, "b.png", b"not really a png");
        let c = incoming(&dir, "c.jpg", JPEG);
        let paths: Vec<PathBuf> = [&a, &b, &c].iter().map(|f| f.path.clone()).collect();

        let batch = orchestrator.upload_batch(vec![a, b, c]).await;

        let ids: Vec<&str> = batch.items.iter().map(|i| i.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a.png", "b.png", "c.jpg"]);
        assert!(batch.items[0].is_success());
        assert_eq!(
            batch.items[1].result.as_ref().unwrap_err().kind,
            ErrorKind::UnsupportedType
        );
        assert!(batch.items[2].is_success());
        assert_eq!(batch.status, StatusClass::ClientError);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_truncated_item_is_too_large() {
        let store = MockBlobStore::new();
        let (orchestrator, dir) = orchestrator(&store, 8).await;

        let item = incoming(&dir, "big.png", PNG).with_truncated(true);
        let path = item.path.clone();
        let batch = orchestrator.upload_batch(vec![item]).await;

        let failure = batch.items[0].result.as_ref().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::TooLarge);
        assert_eq!(store.get_put_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_all_failed_batch_is_still_returned() {
        let store = MockBlobStore::new().with_put_failure(true);
        let (orchestrator, dir) = orchestrator(&store, 1024).await;

        let batch = orchestrator
            .upload_batch(vec![incoming(&dir, "a.png", PNG), incoming(&dir, "b.jpg", JPEG)])
            .await;

        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.succeeded(), 0);
        assert_eq!(batch.status, StatusClass::ServerError);
    }

    #[tokio::test]
    async fn test_duplicate_content_reports_already_exists() {
        let store = MockBlobStore::new();
        let (orchestrator, dir) = orchestrator(&store, 1024).await;

        let first = orchestrator
            .upload_batch(vec![incoming(&dir, "a.png", PNG)])
            .await;
        let second = orchestrator
            .upload_batch(vec![incoming(&dir, "copy.png", PNG)])
            .await;

        let a = first.items[0].result.as_ref().unwrap();
        let b = second.items[0].result.as_ref().unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.disposition, Disposition::Created);
        assert_eq!(b.disposition, Disposition::AlreadyExists);
        assert!(a.url.ends_with(&a.key));
        assert_eq!(store.get_put_count(), 1);
    }

    #[tokio::test]
    async fn test_import_by_url_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/photo"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(JPEG.to_vec()))
            .mount(&server)
            .await;

        let store = MockBlobStore::new();
        let (orchestrator, dir) = orchestrator(&store, 1024).await;
        let item = orchestrator
            .import_by_url(&format!("{}/photo", server.uri()))
            .await;

        let asset = item.result.as_ref().unwrap();
        assert!(asset.key.starts_with("uploads/"));
        assert!(asset.key.ends_with(".jpg"));
        assert_eq!(store.get_put_count(), 1);
        assert!(std::fs::read_dir(dir.path().join("fetch"))
            .unwrap()
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn test_import_failure_codes_are_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/large"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let store = MockBlobStore::new();
        let (orchestrator, _dir) = orchestrator(&store, 1024).await;

        let code = |item: BatchItemResult| item.result.unwrap_err().code;
        assert_eq!(
            code(orchestrator.import_by_url("file:///etc/passwd").await),
            "IMPORT_INVALID_URL"
        );
        assert_eq!(
            code(
                orchestrator
                    .import_by_url(&format!("{}/text", server.uri()))
                    .await
            ),
            "IMPORT_UNSUPPORTED_TYPE"
        );
        assert_eq!(
            code(
                orchestrator
                    .import_by_url(&format!("{}/large", server.uri()))
                    .await
            ),
            "IMPORT_STREAM_TOO_LARGE"
        );
        assert_eq!(
            fetch_failure_code(&Error::TooLarge {
                phase: SizePhase::Claimed,
                limit: 1
            }),
            "IMPORT_HEAD_TOO_LARGE"
        );
        assert_eq!(
            fetch_failure_code(&Error::Timeout("x".into())),
            "IMPORT_TIMEOUT"
        );
        assert_eq!(
            store_failure_code(&Error::StoreFailed("x".into())),
            "IMPORT_UPLOAD_FAILED"
        );
    }
}
