//! Service wiring for uploads, URL imports and splash generation.

use crate::batch::{BatchItemResult, BatchResult};
use crate::cache::{spawn_eviction_task, GenerationCache};
use crate::fetch::Fetcher;
use crate::generator::Generator;
use crate::ingest::{IncomingFile, UploadOrchestrator};
use crate::models::{Config, GenerationRequest};
use crate::render::{ProcessRenderer, Renderer};
use crate::scratch::Scratch;
use crate::splash::GenerationOrchestrator;
use crate::store::{BlobStore, MockBlobStore, S3BlobStore};
use crate::templates::TemplateRegistry;
use crate::uploader::Uploader;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One line of input to [`App::serve`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Job {
    Upload { files: Vec<PathBuf> },
    Import { url: String },
    Generate { requests: Vec<GenerationRequest> },
}

/// Owns the orchestrators and the shared generation cache.
pub struct App {
    uploads: UploadOrchestrator,
    splash: GenerationOrchestrator,
    cache: Arc<GenerationCache>,
    staging: Scratch,
    config: Config,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub store: Arc<dyn BlobStore>,
    pub renderer: Arc<dyn Renderer>,
    pub templates: TemplateRegistry,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// This is primarily useful for integration tests and local harnesses that
    /// need to inject mocks.
    pub async fn with_services(services: AppServices, config: Config) -> Result<Self> {
        let scratch_root = config.scratch_dir.clone();
        let staging = Scratch::new(&scratch_root.join("staging")).await?;
        let fetch_scratch = Scratch::new(&scratch_root.join("fetch")).await?;
        let render_scratch = Scratch::new(&scratch_root.join("render")).await?;

        let uploader = Arc::new(Uploader::new(
            services.store.clone(),
            config.cache_control.clone(),
        ));
        let cache = Arc::new(GenerationCache::new(services.store));

        let uploads = UploadOrchestrator::new(
            uploader.clone(),
            Fetcher::new(fetch_scratch, config.head_timeout)?,
            config.upload_prefix.clone(),
            config.max_upload_bytes,
            config.fetch_timeout,
        );

        let generator = Generator::new(
            services.renderer,
            uploader,
            cache.clone(),
            render_scratch,
            config.render_quality,
        );
        let splash = GenerationOrchestrator::new(
            services.templates,
            cache.clone(),
            generator,
            config.splash_prefix.clone(),
            config.max_dimension,
            config.render_timeout,
        );

        Ok(Self {
            uploads,
            splash,
            cache,
            staging,
            config,
        })
    }

    /// Construct an app from environment configuration (`Config::from_env`).
    pub async fn new() -> Result<Self> {
        let config = Config::from_env()?;

        let store: Arc<dyn BlobStore> = if config.dry_run {
            info!("DRY_RUN enabled, using in-memory blob store");
            Arc::new(MockBlobStore::new().with_base_url(config.cdn_base_url.clone()))
        } else {
            let access_key_id = config
                .cdn_access_key_id
                .clone()
                .ok_or_else(|| Error::Config("CDN_ACCESS_KEY_ID not set".to_string()))?;
            let secret_access_key = config
                .cdn_secret_access_key
                .clone()
                .ok_or_else(|| Error::Config("CDN_SECRET_ACCESS_KEY not set".to_string()))?;

            Arc::new(
                S3BlobStore::new(
                    access_key_id,
                    secret_access_key,
                    config.cdn_endpoint.clone(),
                    config.cdn_bucket.clone(),
                    config.cdn_base_url.clone(),
                )
                .await?,
            )
        };

        info!("Renderer: {} {:?}", config.renderer_program, config.renderer_args);
        let renderer = Arc::new(ProcessRenderer::new(
            config.renderer_program.clone(),
            config.renderer_args.clone(),
        ));

        let templates = match &config.template_dir {
            Some(dir) => TemplateRegistry::builtin().with_directory(dir)?,
            None => TemplateRegistry::builtin(),
        };

        Self::with_services(
            AppServices {
                store,
                renderer,
                templates,
            },
            config,
        )
        .await
    }

    pub fn cache(&self) -> &Arc<GenerationCache> {
        &self.cache
    }

    /// Start the periodic cache sweep. Abort the handle to stop it.
    pub fn start_eviction(&self) -> JoinHandle<()> {
        info!(
            "Cache sweep every {:?} (ttl {:?}, max {} entries)",
            self.config.cache_sweep_interval, self.config.cache_ttl, self.config.cache_max_entries
        );
        spawn_eviction_task(
            self.cache.clone(),
            self.config.cache_sweep_interval,
            self.config.cache_ttl,
            self.config.cache_max_entries,
        )
    }

    /// Upload files already staged by a transport; the files are consumed.
    pub async fn upload_batch(&self, items: Vec<IncomingFile>) -> BatchResult {
        self.uploads.upload_batch(items).await
    }

    /// Upload caller-owned files. Each is copied to scratch first so the
    /// originals are never removed.
    pub async fn upload_files(&self, paths: &[PathBuf]) -> BatchResult {
        let mut staged = Vec::new();
        let mut slots = Vec::with_capacity(paths.len());

        for path in paths {
            match self.stage(path).await {
                Ok(file) => {
                    staged.push(file);
                    slots.push(None);
                }
                Err(e) => {
                    warn!("[{}] Could not stage file: {}", path.display(), e);
                    slots.push(Some(BatchItemResult::from_error(
                        path.display().to_string(),
                        &e,
                    )));
                }
            }
        }

        let mut uploaded = self.uploads.upload_batch(staged).await.items.into_iter();
        let items = slots
            .into_iter()
            .filter_map(|slot| slot.or_else(|| uploaded.next()))
            .collect();
        BatchResult::from_items(items)
    }

    // Copies at most one byte past the limit so oversized files are flagged
    // without being read in full.
    async fn stage(&self, source: &Path) -> Result<IncomingFile> {
        let file = tokio::fs::File::open(source).await.map_err(|e| {
            Error::InvalidInput(format!("Cannot read {}: {}", source.display(), e))
        })?;

        let limit = self.config.max_upload_bytes;
        let artifact = self.staging.artifact("upload", None);
        let mut writer = tokio::fs::File::create(artifact.path()).await?;
        let copied = tokio::io::copy(&mut file.take(limit.saturating_add(1)), &mut writer).await?;
        writer.flush().await?;

        Ok(IncomingFile::new(artifact.into_path())
            .with_original_name(source.display().to_string())
            .with_truncated(copied > limit))
    }

    pub async fn import_by_url(&self, url: &str) -> BatchResult {
        BatchResult::from_items(vec![self.uploads.import_by_url(url).await])
    }

    pub async fn generate_batch(&self, requests: Vec<GenerationRequest>) -> BatchResult {
        self.splash.generate_batch(requests).await
    }

    pub async fn run_job(&self, job: Job) -> BatchResult {
        match job {
            Job::Upload { files } => self.upload_files(&files).await,
            Job::Import { url } => self.import_by_url(&url).await,
            Job::Generate { requests } => self.generate_batch(requests).await,
        }
    }

    /// Read one JSON [`Job`] per line and write one [`BatchResult`] JSON line
    /// per job. A malformed line yields a single failed item, not an error.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let result = match serde_json::from_str::<Job>(&line) {
                Ok(job) => self.run_job(job).await,
                Err(e) => {
                    warn!("Ignoring malformed job on line {}: {}", line_no, e);
                    let error = Error::InvalidInput(format!("Malformed job: {}", e));
                    BatchResult::from_items(vec![BatchItemResult::from_error(
                        format!("line {}", line_no),
                        &error,
                    )])
                }
            };

            let mut encoded = serde_json::to_string(&result)?;
            encoded.push('\n');
            output.write_all(encoded.as_bytes()).await?;
            output.flush().await?;
        }

        info!("Input closed after {} line(s)", line_no);
        Ok(())
    }
}
