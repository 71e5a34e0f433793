//! Bounded remote downloads
//!
//! One deadline covers the HEAD request and the streamed GET together. The
//! byte ceiling is enforced on the running count of received bytes, so a
//! missing or lying `Content-Length` cannot get past it.

use crate::error::SizePhase;
use crate::scratch::{Scratch, TempArtifact};
use crate::{Error, Result};
use futures::StreamExt;
use reqwest::{header, Client, Url};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

#[derive(Debug)]
pub struct FetchedFile {
    pub artifact: TempArtifact,
    pub bytes: u64,
    /// Last path segment of the source URL, for reporting only.
    pub source_name: Option<String>,
}

pub struct Fetcher {
    client: Client,
    scratch: Scratch,
    head_timeout: Duration,
}

/// Parse `uri`, accepting only http and https.
pub fn parse_http_url(uri: &str) -> Result<Url> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidInput(format!("Invalid URL '{}': {}", uri, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::InvalidInput(format!(
            "Unsupported URL scheme '{}', expected http or https",
            other
        ))),
    }
}

fn claimed_length(headers: &header::HeaderMap) -> Option<u64> {
    // Read the header directly; reqwest reports a zero body size for HEAD.
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

impl Fetcher {
    pub fn new(scratch: Scratch, head_timeout: Duration) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            scratch,
            head_timeout,
        })
    }

    pub async fn fetch(&self, uri: &str, max_bytes: u64, deadline: Duration) -> Result<FetchedFile> {
        let url = parse_http_url(uri)?;
        let deadline = Instant::now() + deadline;

        self.check_claimed_size(&url, max_bytes, deadline).await?;

        let artifact = self.scratch.artifact("fetch", None);
        let streamed = timeout_at(deadline, self.stream_to(&url, artifact.path(), max_bytes)).await;

        match streamed {
            Ok(Ok(bytes)) => {
                info!("Fetched {} ({} bytes)", url, bytes);
                let source_name = url
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                Ok(FetchedFile {
                    artifact,
                    bytes,
                    source_name,
                })
            }
            Ok(Err(e)) => {
                artifact.remove().await;
                Err(e)
            }
            Err(_) => {
                artifact.remove().await;
                Err(Error::Timeout(format!("Deadline exceeded downloading {}", url)))
            }
        }
    }

    /// Best-effort HEAD size check. Only an oversized claim or the shared deadline
    /// are fatal; every other failure falls through to the GET.
    async fn check_claimed_size(&self, url: &Url, max_bytes: u64, deadline: Instant) -> Result<()> {
        let head = timeout(self.head_timeout, self.client.head(url.clone()).send());

        let response = match timeout_at(deadline, head).await {
            Err(_) => {
                return Err(Error::Timeout(format!("Deadline exceeded checking size of {}", url)));
            }
            Ok(Err(_)) => {
                warn!("HEAD {} timed out, continuing with GET", url);
                return Ok(());
            }
            Ok(Ok(Err(e))) => {
                warn!("HEAD {} failed: {}, continuing with GET", url, e);
                return Ok(());
            }
            Ok(Ok(Ok(response))) => response,
        };

        if !response.status().is_success() {
            warn!(
                "HEAD {} returned {}, continuing with GET",
                url,
                response.status()
            );
            return Ok(());
        }

        match claimed_length(response.headers()) {
            Some(claimed) if claimed > max_bytes => {
                warn!("{} claims {} bytes, limit is {}", url, claimed, max_bytes);
                Err(Error::TooLarge {
                    phase: SizePhase::Claimed,
                    limit: max_bytes,
                })
            }
            _ => Ok(()),
        }
    }

    async fn stream_to(&self, url: &Url, path: &Path, max_bytes: u64) -> Result<u64> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::FetchFailed(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::FetchFailed(format!(
                "GET {} returned status {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::FetchFailed(format!("Reading {} failed: {}", url, e)))?;
            received += chunk.len() as u64;
            if received > max_bytes {
                // Returning drops the stream, which aborts the transfer.
                warn!("{} exceeded {} bytes mid-transfer", url, max_bytes);
                return Err(Error::TooLarge {
                    phase: SizePhase::Streamed,
                    limit: max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(received)
    }
}
