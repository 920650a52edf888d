//! Remote release metadata and archive downloads.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Name of the optional checksum asset published next to the archive.
pub const CHECKSUMS_ASSET: &str = "SHA256SUMS";

/// One downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// File name.
    pub name: String,
    /// Where the file can be downloaded from.
    #[serde(alias = "browser_download_url")]
    pub download_location: String,
}

/// Remote description of the latest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    /// Release tag, usually `v<major>.<minor>.<patch>`.
    pub tag_name: String,
    /// Attached files.
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    /// Free-text release notes.
    #[serde(default)]
    pub body: Option<String>,
    /// Publish timestamp.
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ReleaseMetadata {
    /// Parse a releases API document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the document is not valid release JSON.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Parse(format!("release metadata: {e}")))
    }

    /// Release notes, empty when the release has none.
    #[must_use]
    pub fn notes(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    /// The first asset that looks like a supported archive.
    #[must_use]
    pub fn archive_asset(&self) -> Option<&ReleaseAsset> {
        self.assets
            .iter()
            .find(|asset| super::fetch::ArchiveFormat::from_name(&asset.name).is_some())
    }

    /// The checksum list, if the release publishes one.
    #[must_use]
    pub fn checksums_asset(&self) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == CHECKSUMS_ASSET)
    }
}

/// Download progress, reported once per received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub downloaded: u64,
    /// Size announced by the server, if any.
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Completion percentage, when the total size is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.downloaded as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch metadata for the latest release of `repository` (owner/repo).
    ///
    /// # Errors
    ///
    /// [`Error::Network`] for transport failures, [`Error::Parse`] for a
    /// malformed document.
    async fn latest_release(&self, repository: &str) -> Result<ReleaseMetadata>;

    /// Stream `url` into `sink`, reporting progress per chunk.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// [`Error::Network`] for transport failures or a truncated body,
    /// [`Error::Filesystem`] if the sink rejects a write.
    async fn download(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64>;
}

/// Releases served by the GitHub releases API.
pub struct GithubReleaseSource {
    client: reqwest::Client,
    api_base_url: String,
    timeout: Duration,
}

impl GithubReleaseSource {
    /// Create a source for `api_base_url` with a fixed per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("os-health-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    async fn latest_release(&self, repository: &str) -> Result<ReleaseMetadata> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base_url, repository);
        debug!("Fetching release metadata from {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "releases API returned {}",
                response.status()
            )));
        }

        let body = response.bytes().await?;
        ReleaseMetadata::parse(&body)
    }

    async fn download(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64> {
        debug!("Downloading {}", url);

        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| Error::Network(format!("timed out connecting to {url}")))??
            .error_for_status()?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        // Each chunk gets the full timeout; the body is never buffered whole.
        while let Some(chunk) = tokio::time::timeout(self.timeout, stream.next())
            .await
            .map_err(|_| Error::Network(format!("download stalled: {url}")))?
        {
            let chunk = chunk?;
            sink.write_all(&chunk)
                .await
                .map_err(|e| Error::Filesystem(format!("writing download: {e}")))?;
            downloaded += chunk.len() as u64;
            progress(DownloadProgress { downloaded, total });
        }

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(Error::Network(format!(
                    "truncated download: got {downloaded} of {expected} bytes"
                )));
            }
        }

        sink.flush()
            .await
            .map_err(|e| Error::Filesystem(format!("flushing download: {e}")))?;
        Ok(downloaded)
    }
}
