//! Data models and structures
//!
//! Defines remote keys, upload outcomes, generation requests/specs and the
//! service configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Deterministic `prefix/digest.ext` location of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteKey(String);

impl RemoteKey {
    pub fn new(prefix: &str, digest: &str, extension: Option<&str>) -> Self {
        let prefix = prefix.trim_matches('/');
        let file = match extension.filter(|ext| !ext.is_empty()) {
            Some(ext) => format!("{}.{}", digest, ext.to_ascii_lowercase()),
            None => digest.to_string(),
        };

        if prefix.is_empty() {
            Self(file)
        } else {
            Self(format!("{}/{}", prefix, file))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a content-addressed upload. Both variants are successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Created { key: RemoteKey, digest: String },
    AlreadyExists { key: RemoteKey, digest: String },
}

impl UploadOutcome {
    pub fn key(&self) -> &RemoteKey {
        match self {
            UploadOutcome::Created { key, .. } | UploadOutcome::AlreadyExists { key, .. } => key,
        }
    }

    pub fn digest(&self) -> &str {
        match self {
            UploadOutcome::Created { digest, .. }
            | UploadOutcome::AlreadyExists { digest, .. } => digest,
        }
    }
}

/// Caller-supplied generation request, validated into a [`GenerationSpec`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub experience_id: String,
    pub aspect_ratio: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub thumbnails: Vec<String>,
}

impl GenerationRequest {
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.experience_id, self.aspect_ratio)
    }
}

/// Every input that determines a generated artifact's bytes and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSpec {
    pub experience_id: String,
    pub aspect_ratio: String,
    pub width: u32,
    pub height: u32,
    pub thumbnails: Vec<String>,
    pub template: String,
    pub dest_prefix: String,
}

impl GenerationSpec {
    /// SHA-256 over the JSON encoding of this struct. Field order is the
    /// declaration order above, so the digest is stable across runs.
    pub fn digest(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    pub fn identifier(&self) -> String {
        format!("{}:{}", self.experience_id, self.aspect_ratio)
    }
}

// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub cdn_access_key_id: Option<String>,
    pub cdn_secret_access_key: Option<String>,
    pub cdn_endpoint: String,
    pub cdn_bucket: String,
    pub cdn_base_url: String,
    pub cache_control: String,
    pub dry_run: bool,
    pub scratch_dir: PathBuf,
    pub template_dir: Option<PathBuf>,
    pub upload_prefix: String,
    pub splash_prefix: String,
    pub max_upload_bytes: u64,
    pub fetch_timeout: Duration,
    pub head_timeout: Duration,
    pub render_timeout: Duration,
    pub render_quality: u8,
    pub max_dimension: u32,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub cache_sweep_interval: Duration,
    pub renderer_program: String,
    pub renderer_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cdn_access_key_id: None,
            cdn_secret_access_key: None,
            cdn_endpoint: "https://nyc3.digitaloceanspaces.com".to_string(),
            cdn_bucket: "splashgen".to_string(),
            cdn_base_url: "https://cdn.example.com".to_string(),
            cache_control: "public, max-age=31536000, immutable".to_string(),
            dry_run: false,
            scratch_dir: std::env::temp_dir().join("splashgen"),
            template_dir: None,
            upload_prefix: "uploads".to_string(),
            splash_prefix: "splash".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
            head_timeout: Duration::from_secs(5),
            render_timeout: Duration::from_secs(30),
            render_quality: 85,
            max_dimension: 4096,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache_max_entries: 1000,
            cache_sweep_interval: Duration::from_secs(300),
            renderer_program: "splash-renderer".to_string(),
            renderer_args: Vec::new(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let dry_run = env_parse("DRY_RUN", false)?;
        let cdn_access_key_id = std::env::var("CDN_ACCESS_KEY_ID").ok();
        let cdn_secret_access_key = std::env::var("CDN_SECRET_ACCESS_KEY").ok();

        if !dry_run {
            if cdn_access_key_id.is_none() {
                return Err(Error::Config("CDN_ACCESS_KEY_ID not set".to_string()));
            }
            if cdn_secret_access_key.is_none() {
                return Err(Error::Config("CDN_SECRET_ACCESS_KEY not set".to_string()));
            }
        }

        let render_quality: u8 = env_parse("RENDER_QUALITY", defaults.render_quality)?;
        if !(1..=100).contains(&render_quality) {
            return Err(Error::Config(format!(
                "RENDER_QUALITY must be within 1..=100, got {}",
                render_quality
            )));
        }

        Ok(Self {
            cdn_access_key_id,
            cdn_secret_access_key,
            cdn_endpoint: std::env::var("CDN_ENDPOINT").unwrap_or(defaults.cdn_endpoint),
            cdn_bucket: std::env::var("CDN_BUCKET").unwrap_or(defaults.cdn_bucket),
            cdn_base_url: std::env::var("CDN_BASE_URL").unwrap_or(defaults.cdn_base_url),
            cache_control: std::env::var("CACHE_CONTROL").unwrap_or(defaults.cache_control),
            dry_run,
            scratch_dir: std::env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            template_dir: std::env::var("TEMPLATE_DIR").ok().map(PathBuf::from),
            upload_prefix: std::env::var("UPLOAD_PREFIX").unwrap_or(defaults.upload_prefix),
            splash_prefix: std::env::var("SPLASH_PREFIX").unwrap_or(defaults.splash_prefix),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            fetch_timeout: env_secs("FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            head_timeout: env_secs("HEAD_TIMEOUT_SECS", defaults.head_timeout)?,
            render_timeout: env_secs("RENDER_TIMEOUT_SECS", defaults.render_timeout)?,
            render_quality,
            max_dimension: env_parse("MAX_DIMENSION", defaults.max_dimension)?,
            cache_ttl: env_secs("CACHE_TTL_SECS", defaults.cache_ttl)?,
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES", defaults.cache_max_entries)?,
            cache_sweep_interval: env_secs("CACHE_SWEEP_SECS", defaults.cache_sweep_interval)?,
            renderer_program: std::env::var("RENDERER_PROGRAM")
                .unwrap_or(defaults.renderer_program),
            renderer_args: std::env::var("RENDERER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}
