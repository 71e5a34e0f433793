//! Generation orchestration
//!
//! Validates a batch of [`GenerationRequest`]s into specs, answers what it can
//! from the generation cache and renders the rest. Invalid requests are
//! rejected before the cache or the renderer ever see them.

use crate::batch::{AssetRef, BatchItemResult, BatchResult, Disposition};
use crate::cache::{CacheLookup, GenerationCache};
use crate::fetch::parse_http_url;
use crate::generator::Generator;
use crate::models::{GenerationRequest, GenerationSpec};
use crate::templates::TemplateRegistry;
use crate::{Error, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct GenerationOrchestrator {
    templates: TemplateRegistry,
    cache: Arc<GenerationCache>,
    generator: Generator,
    splash_prefix: String,
    max_dimension: u32,
    deadline: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        templates: TemplateRegistry,
        cache: Arc<GenerationCache>,
        generator: Generator,
        splash_prefix: String,
        max_dimension: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            templates,
            cache,
            generator,
            splash_prefix,
            max_dimension,
            deadline,
        }
    }

    pub async fn generate_batch(&self, requests: Vec<GenerationRequest>) -> BatchResult {
        info!("Generating batch of {} splash image(s)", requests.len());
        let results = join_all(requests.iter().map(|request| self.generate_item(request))).await;
        BatchResult::from_items(results)
    }

    async fn generate_item(&self, request: &GenerationRequest) -> BatchItemResult {
        let identifier = request.identifier();

        match self.generate_one(request).await {
            Ok(asset) => BatchItemResult::success(identifier, asset),
            Err(e) => {
                warn!("[{}] Generation failed: {}", identifier, e);
                BatchItemResult::from_error(identifier, &e)
            }
        }
    }

    async fn generate_one(&self, request: &GenerationRequest) -> Result<AssetRef> {
        let spec = self.validate(request)?;

        if let CacheLookup::Hit { key, digest } = self.cache.lookup(&spec).await? {
            info!("[{}] Reusing {}", spec.identifier(), key);
            return Ok(AssetRef {
                url: self.generator.public_url(key.as_str()),
                key: key.to_string(),
                digest,
                disposition: Disposition::Cached,
            });
        }

        let outcome = self.generator.generate(&spec, self.deadline).await?;
        let url = self.generator.public_url(outcome.key().as_str());
        Ok(AssetRef::from_outcome(&outcome, url))
    }

    /// Turn a request into a spec, or explain why it cannot be rendered.
    pub fn validate(&self, request: &GenerationRequest) -> Result<GenerationSpec> {
        validate_experience_id(&request.experience_id)?;

        let template = self.templates.get(&request.aspect_ratio).ok_or_else(|| {
            Error::InvalidInput(format!("Unknown aspect ratio '{}'", request.aspect_ratio))
        })?;

        let width = self.dimension("width", request.width)?;
        let height = self.dimension("height", request.height)?;

        if request.thumbnails.is_empty() {
            return Err(Error::InvalidInput("At least one thumbnail is required".to_string()));
        }
        for thumbnail in &request.thumbnails {
            parse_http_url(thumbnail)?;
        }

        Ok(GenerationSpec {
            experience_id: request.experience_id.clone(),
            aspect_ratio: request.aspect_ratio.clone(),
            width,
            height,
            thumbnails: request.thumbnails.clone(),
            template: template.to_string(),
            dest_prefix: format!(
                "{}/{}",
                self.splash_prefix.trim_end_matches('/'),
                request.experience_id
            ),
        })
    }

    fn dimension(&self, name: &str, value: Option<u32>) -> Result<u32> {
        match value {
            None => Err(Error::InvalidInput(format!("Missing {}", name))),
            Some(0) => Err(Error::InvalidInput(format!("{} must be positive", name))),
            Some(v) if v > self.max_dimension => Err(Error::InvalidInput(format!(
                "{} {} exceeds maximum of {}",
                name, v, self.max_dimension
            ))),
            Some(v) => Ok(v),
        }
    }
}

// The id becomes one segment of the remote key.
fn validate_experience_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidInput("Missing experience_id".to_string()));
    }
    let segment_safe = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !segment_safe || id == "." || id == ".." {
        return Err(Error::InvalidInput(format!("Invalid experience_id '{}'", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StatusClass;
    use crate::cache::output_key;
    use crate::error::ErrorKind;
    use crate::render::MockRenderer;
    use crate::scratch::Scratch;
    use crate::store::MockBlobStore;
    use crate::uploader::Uploader;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        orchestrator: GenerationOrchestrator,
        renderer: MockRenderer,
        store: MockBlobStore,
        cache: Arc<GenerationCache>,
        _scratch_dir: TempDir,
    }

    async fn harness(renderer: MockRenderer, store: MockBlobStore) -> Harness {
        let scratch_dir = tempdir().unwrap();
        let scratch = Scratch::new(scratch_dir.path()).await.unwrap();
        let cache = Arc::new(GenerationCache::new(Arc::new(store.clone())));
        let uploader = Arc::new(Uploader::new(Arc::new(store.clone()), "public".to_string()));
        let generator = Generator::new(
            Arc::new(renderer.clone()),
            uploader,
            cache.clone(),
            scratch,
            85,
        );
        let orchestrator = GenerationOrchestrator::new(
            TemplateRegistry::builtin(),
            cache.clone(),
            generator,
            "splash".to_string(),
            256,
            Duration::from_secs(5),
        );

        Harness {
            orchestrator,
            renderer,
            store,
            cache,
            _scratch_dir: scratch_dir,
        }
    }

    fn request(aspect_ratio: &str, width: u32, height: u32) -> GenerationRequest {
        GenerationRequest {
            experience_id: "exp-1".to_string(),
            aspect_ratio: aspect_ratio.to_string(),
            width: Some(width),
            height: Some(height),
            thumbnails: vec![
                "https://cdn.test/a.jpg".to_string(),
                "https://cdn.test/b.jpg".to_string(),
            ],
        }
    }

    fn failure_kind(item: &BatchItemResult) -> ErrorKind {
        item.result.as_ref().unwrap_err().kind
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_cache_or_renderer() {
        let h = harness(MockRenderer::new(), MockBlobStore::new()).await;

        let mut missing_height = request("16x9", 160, 90);
        missing_height.height = None;
        let mut no_thumbnails = request("1x1", 64, 64);
        no_thumbnails.thumbnails.clear();
        let mut bad_id = request("1x1", 64, 64);
        bad_id.experience_id = "../etc".to_string();
        let mut bad_thumbnail = request("1x1", 64, 64);
        bad_thumbnail.thumbnails = vec!["file:///etc/passwd".to_string()];

        let batch = h
            .orchestrator
            .generate_batch(vec![
                missing_height,
                request("16x9", 0, 90),
                request("16x9", 1600, 900),
                request("21x9", 210, 90),
                no_thumbnails,
                bad_id,
                bad_thumbnail,
            ])
            .await;

        assert_eq!(batch.status, StatusClass::ClientError);
        assert!(batch
            .items
            .iter()
            .all(|item| failure_kind(item) == ErrorKind::InvalidInput));
        assert_eq!(h.renderer.get_create_count(), 0);
        assert_eq!(h.store.get_head_count(), 0);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_renderer() {
        let h = harness(MockRenderer::new(), MockBlobStore::new()).await;

        let first = h
            .orchestrator
            .generate_batch(vec![request("4x3", 64, 48)])
            .await;
        let created = first.items[0].result.clone().unwrap();
        assert_eq!(created.disposition, Disposition::Created);
        assert_eq!(h.renderer.get_create_count(), 1);

        let second = h
            .orchestrator
            .generate_batch(vec![request("4x3", 64, 48)])
            .await;
        let cached = second.items[0].result.clone().unwrap();

        assert_eq!(cached.disposition, Disposition::Cached);
        assert_eq!(cached.key, created.key);
        assert_eq!(cached.digest, created.digest);
        assert_eq!(cached.url, format!("https://mock-cdn.example.com/{}", created.key));
        assert_eq!(h.renderer.get_create_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_regenerates() {
        let h = harness(MockRenderer::new(), MockBlobStore::new()).await;
        let req = request("1x1", 32, 32);

        let first = h.orchestrator.generate_batch(vec![req.clone()]).await;
        let key = first.items[0].result.clone().unwrap().key;
        h.store.remove_object(&key);

        let second = h.orchestrator.generate_batch(vec![req]).await;

        assert_eq!(
            second.items[0].result.clone().unwrap().disposition,
            Disposition::Created
        );
        assert_eq!(h.renderer.get_create_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_keeps_request_order_with_mixed_results() {
        let h = harness(MockRenderer::new(), MockBlobStore::new()).await;

        let batch = h
            .orchestrator
            .generate_batch(vec![
                request("16x9", 160, 90),
                request("nope", 10, 10),
                request("9x16", 90, 160),
            ])
            .await;

        let ids: Vec<&str> = batch.items.iter().map(|i| i.identifier.as_str()).collect();
        assert_eq!(ids, vec!["exp-1:16x9", "exp-1:nope", "exp-1:9x16"]);
        assert!(batch.items[0].is_success());
        assert_eq!(failure_kind(&batch.items[1]), ErrorKind::InvalidInput);
        assert!(batch.items[2].is_success());
        assert_eq!(batch.status, StatusClass::ClientError);
        assert_eq!(h.renderer.get_create_count(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_is_server_error() {
        let renderer = MockRenderer::new().with_render_size(1, 1);
        let h = harness(renderer, MockBlobStore::new()).await;

        let batch = h
            .orchestrator
            .generate_batch(vec![request("1x1", 32, 32)])
            .await;

        assert_eq!(failure_kind(&batch.items[0]), ErrorKind::RenderFailed);
        assert_eq!(batch.status, StatusClass::ServerError);
    }

    #[tokio::test]
    async fn test_spec_destination_is_per_experience() {
        let h = harness(MockRenderer::new(), MockBlobStore::new()).await;

        let spec = h.orchestrator.validate(&request("16x9", 160, 90)).unwrap();
        assert_eq!(spec.dest_prefix, "splash/exp-1");
        assert_eq!(spec.template, TemplateRegistry::builtin().get("16x9").unwrap());
        assert_eq!(output_key(&spec, "abc").as_str(), "splash/exp-1/abc.jpg");
    }
}
