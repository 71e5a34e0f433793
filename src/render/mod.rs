//! External HTML renderer
//!
//! The renderer is an opaque subprocess that loads an HTML document and
//! rasterizes it to an image file. It is driven through a handle/page
//! interface so the generator can tear every piece down on its own.

pub mod mock;
pub mod process;

pub use mock::MockRenderer;
pub use process::ProcessRenderer;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Security flags passed to the renderer process at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOptions {
    pub web_security: bool,
    pub local_file_access: bool,
    pub ignore_ssl_errors: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            web_security: true,
            local_file_access: true,
            ignore_ssl_errors: false,
        }
    }
}

/// Status reported by the renderer after loading a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    Success,
    Failed(String),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn create(&self, options: &SecurityOptions) -> Result<Box<dyn RendererHandle>>;
}

#[async_trait]
pub trait RendererHandle: Send + Sync {
    async fn create_page(&self) -> Result<Box<dyn RenderPage>>;
    /// Terminate the renderer process.
    async fn exit(&self) -> Result<()>;
}

#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<()>;
    async fn open(&self, document: &Path) -> Result<PageStatus>;
    async fn render(&self, output: &Path, quality: u8) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
