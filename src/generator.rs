//! Splash image generation
//!
//! Compiles a spec's template to HTML, has the external renderer rasterize
//! it, uploads the image and records it in the generation cache. The whole
//! pipeline runs under one deadline, and the renderer page, the renderer
//! process and both scratch files are torn down on every exit path.

use crate::cache::{GenerationCache, OUTPUT_EXTENSION};
use crate::models::{GenerationSpec, UploadOutcome};
use crate::render::{PageStatus, RenderPage, Renderer, RendererHandle, SecurityOptions};
use crate::scratch::{Scratch, TempArtifact};
use crate::sniff;
use crate::templates;
use crate::uploader::Uploader;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";
const PAGE_CLOSE_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on closing the page and stopping the renderer together.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Renderer resources acquired so far; whatever is set gets torn down.
#[derive(Default)]
struct Session {
    handle: Option<Box<dyn RendererHandle>>,
    page: Option<Box<dyn RenderPage>>,
}

pub struct Generator {
    renderer: Arc<dyn Renderer>,
    uploader: Arc<Uploader>,
    cache: Arc<GenerationCache>,
    scratch: Scratch,
    quality: u8,
}

impl Generator {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        uploader: Arc<Uploader>,
        cache: Arc<GenerationCache>,
        scratch: Scratch,
        quality: u8,
    ) -> Self {
        Self {
            renderer,
            uploader,
            cache,
            scratch,
            quality,
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        self.uploader.store().public_url(key)
    }

    pub async fn generate(&self, spec: &GenerationSpec, deadline: Duration) -> Result<UploadOutcome> {
        let document = self.scratch.artifact("splash", Some("html"));
        let output = self.scratch.artifact("splash", Some(OUTPUT_EXTENSION));
        let mut session = Session::default();

        info!("[{}] Rendering {}x{}", spec.identifier(), spec.width, spec.height);
        let outcome = timeout(
            deadline,
            self.run(spec, &mut session, document.path(), output.path()),
        )
        .await;

        self.teardown(spec, session, document, output).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("[{}] Generation exceeded {:?}", spec.identifier(), deadline);
                Err(Error::Timeout(format!(
                    "Generation of {} exceeded {:?}",
                    spec.identifier(),
                    deadline
                )))
            }
        }
    }

    async fn run(
        &self,
        spec: &GenerationSpec,
        session: &mut Session,
        document: &Path,
        output: &Path,
    ) -> Result<UploadOutcome> {
        tokio::fs::write(document, templates::compile(spec)).await?;

        let handle = session
            .handle
            .insert(self.renderer.create(&SecurityOptions::default()).await?);
        let page = session.page.insert(handle.create_page().await?);

        page.set_viewport(spec.width, spec.height).await?;
        if let PageStatus::Failed(status) = page.open(document).await? {
            return Err(Error::RenderFailed(format!(
                "Renderer could not open document: {}",
                status
            )));
        }
        page.render(output, self.quality).await?;
        verify_output(output.to_path_buf(), spec.width, spec.height).await?;
        let rendered = sniff::digest(output).await?;

        let outcome = self
            .uploader
            .upload(output, &spec.dest_prefix, OUTPUT_CONTENT_TYPE)
            .await?;

        // The object at the key was replaced out of band; never cache it.
        if outcome.digest() != rendered {
            warn!(
                "[{}] {} holds digest {}, rendered {}",
                spec.identifier(),
                outcome.key(),
                outcome.digest(),
                rendered
            );
            return Err(Error::StoreFailed(format!(
                "{} holds different content than the rendered image",
                outcome.key()
            )));
        }
        self.cache.record(spec, &rendered)?;
        info!("[{}] Generated {}", spec.identifier(), outcome.key());

        Ok(outcome)
    }

    // Failures here are logged only; they must not replace the pipeline
    // outcome. A renderer that outlives TEARDOWN_GRACE is dropped, which
    // kills its process.
    async fn teardown(
        &self,
        spec: &GenerationSpec,
        session: Session,
        document: TempArtifact,
        output: TempArtifact,
    ) {
        let stop_by = Instant::now() + TEARDOWN_GRACE;

        if let Some(page) = session.page {
            match timeout(PAGE_CLOSE_GRACE, page.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{}] Failed to close page: {}", spec.identifier(), e),
                Err(_) => warn!("[{}] Timed out closing page", spec.identifier()),
            }
        }
        if let Some(handle) = session.handle {
            match timeout_at(stop_by, handle.exit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{}] Failed to stop renderer: {}", spec.identifier(), e),
                Err(_) => warn!("[{}] Renderer did not stop in time, dropping it", spec.identifier()),
            }
        }
        document.remove().await;
        output.remove().await;
    }
}

/// The rasterized file must decode and match the requested viewport.
async fn verify_output(path: PathBuf, width: u32, height: u32) -> Result<()> {
    let dimensions = tokio::task::spawn_blocking(move || image::image_dimensions(&path))
        .await
        .map_err(|e| Error::Internal(format!("Image verification task join error: {}", e)))?
        .map_err(|e| Error::RenderFailed(format!("Renderer output is not a readable image: {}", e)))?;

    if dimensions != (width, height) {
        return Err(Error::RenderFailed(format!(
            "Renderer produced {}x{}, expected {}x{}",
            dimensions.0, dimensions.1, width, height
        )));
    }
    Ok(())
}
