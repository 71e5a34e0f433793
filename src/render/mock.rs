use super::{PageStatus, RenderPage, Renderer, RendererHandle, SecurityOptions};
use crate::{Error, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageEncoder, RgbImage};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Calls {
    create: usize,
    create_page: usize,
    set_viewport: usize,
    open: usize,
    render: usize,
    close: usize,
    exit: usize,
}

#[derive(Debug, Clone)]
struct Behavior {
    open_status: PageStatus,
    hang_on_open: bool,
    hang_on_shutdown: bool,
    render_size: Option<(u32, u32)>,
}

/// Renderer double that counts every call and writes a real JPEG on render.
#[derive(Clone)]
pub struct MockRenderer {
    calls: Arc<Mutex<Calls>>,
    behavior: Arc<Mutex<Behavior>>,
    viewport: Arc<Mutex<Option<(u32, u32)>>>,
    last_document: Arc<Mutex<Option<String>>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Calls::default())),
            behavior: Arc::new(Mutex::new(Behavior {
                open_status: PageStatus::Success,
                hang_on_open: false,
                hang_on_shutdown: false,
                render_size: None,
            })),
            viewport: Arc::new(Mutex::new(None)),
            last_document: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_open_status(self, status: PageStatus) -> Self {
        self.behavior.lock().unwrap().open_status = status;
        self
    }

    /// `open` never returns, as a wedged renderer would.
    pub fn with_hanging_open(self) -> Self {
        self.behavior.lock().unwrap().hang_on_open = true;
        self
    }

    /// `close` and `exit` never return.
    pub fn with_hanging_shutdown(self) -> Self {
        self.behavior.lock().unwrap().hang_on_shutdown = true;
        self
    }

    /// Rasterize at a fixed size instead of the viewport size.
    pub fn with_render_size(self, width: u32, height: u32) -> Self {
        self.behavior.lock().unwrap().render_size = Some((width, height));
        self
    }

    pub fn get_create_count(&self) -> usize {
        self.calls.lock().unwrap().create
    }

    pub fn get_create_page_count(&self) -> usize {
        self.calls.lock().unwrap().create_page
    }

    pub fn get_open_count(&self) -> usize {
        self.calls.lock().unwrap().open
    }

    pub fn get_render_count(&self) -> usize {
        self.calls.lock().unwrap().render
    }

    pub fn get_close_count(&self) -> usize {
        self.calls.lock().unwrap().close
    }

    pub fn get_exit_count(&self) -> usize {
        self.calls.lock().unwrap().exit
    }

    pub fn get_set_viewport_count(&self) -> usize {
        self.calls.lock().unwrap().set_viewport
    }

    /// Contents of the last document passed to `open`.
    pub fn get_last_document(&self) -> Option<String> {
        self.last_document.lock().unwrap().clone()
    }

    async fn hang_if_shutdown_wedged(&self) {
        let hang = self.behavior.lock().unwrap().hang_on_shutdown;
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn create(&self, _options: &SecurityOptions) -> Result<Box<dyn RendererHandle>> {
        self.calls.lock().unwrap().create += 1;
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl RendererHandle for MockRenderer {
    async fn create_page(&self) -> Result<Box<dyn RenderPage>> {
        self.calls.lock().unwrap().create_page += 1;
        // Pages share counters but each keeps its own viewport.
        let mut page = self.clone();
        page.viewport = Arc::new(Mutex::new(None));
        Ok(Box::new(page))
    }

    async fn exit(&self) -> Result<()> {
        self.calls.lock().unwrap().exit += 1;
        self.hang_if_shutdown_wedged().await;
        Ok(())
    }
}

#[async_trait]
impl RenderPage for MockRenderer {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.calls.lock().unwrap().set_viewport += 1;
        *self.viewport.lock().unwrap() = Some((width, height));
        Ok(())
    }

    async fn open(&self, document: &Path) -> Result<PageStatus> {
        self.calls.lock().unwrap().open += 1;
        let behavior = self.behavior.lock().unwrap().clone();

        let contents = tokio::fs::read_to_string(document).await.ok();
        *self.last_document.lock().unwrap() = contents;

        if behavior.hang_on_open {
            std::future::pending::<()>().await;
        }
        Ok(behavior.open_status)
    }

    async fn render(&self, output: &Path, quality: u8) -> Result<()> {
        self.calls.lock().unwrap().render += 1;

        let size = self.behavior.lock().unwrap().render_size;
        let viewport = *self.viewport.lock().unwrap();
        let (width, height) = size
            .or(viewport)
            .ok_or_else(|| Error::RenderFailed("Viewport was never set".to_string()))?;

        let image = RgbImage::from_pixel(width, height, image::Rgb([30, 60, 90]));
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality).write_image(
            image.as_raw(),
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )?;
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().unwrap().close += 1;
        self.hang_if_shutdown_wedged().await;
        Ok(())
    }
}
