//! splashgen - content-addressed image uploads and cached splash generation
//!
//! Uploads images to S3-compatible storage under digest-derived keys so the
//! same bytes are only ever stored once, imports images from remote URLs with
//! strict size and time bounds, and renders per-experience splash images
//! through an external renderer, caching generated outputs by spec digest.

pub mod app;
pub mod batch;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod generator;
pub mod ingest;
pub mod models;
pub mod render;
pub mod scratch;
pub mod sniff;
pub mod splash;
pub mod store;
pub mod templates;
pub mod uploader;

pub use error::{Error, Result};
