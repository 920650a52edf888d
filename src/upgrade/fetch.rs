//! Downloads a release archive and extracts it into a staging area.

use crate::error::{Error, Result};
use crate::upgrade::fsops::sha256_file;
use crate::upgrade::source::{DownloadProgress, ReleaseMetadata, ReleaseSource, CHECKSUMS_ASSET};
use crate::upgrade::version::Version;
use crate::upgrade::UpdateContext;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Supported release archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.zip`
    Zip,
    /// `.tar.gz` / `.tgz`
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a file name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// The archive an attempt will download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    /// File name used for checksum lookup.
    pub name: String,
    /// Download location.
    pub url: String,
    /// Archive format.
    pub format: ArchiveFormat,
}

/// Pick the archive asset of a release.
///
/// Releases without an archive asset fall back to the source archive GitHub
/// generates for every tag.
#[must_use]
pub fn select_archive(metadata: &ReleaseMetadata, repository: &str) -> ArchiveSource {
    if let Some((asset, format)) = metadata
        .archive_asset()
        .and_then(|asset| ArchiveFormat::from_name(&asset.name).map(|f| (asset, f)))
    {
        return ArchiveSource {
            name: asset.name.clone(),
            url: asset.download_location.clone(),
            format,
        };
    }

    let tag = &metadata.tag_name;
    debug!("Release {} has no archive asset, using source archive", tag);
    ArchiveSource {
        name: format!("{tag}.zip"),
        url: format!("https://github.com/{repository}/archive/{tag}.zip"),
        format: ArchiveFormat::Zip,
    }
}

/// An extracted candidate release.
///
/// The staging directory, with the downloaded archive and everything
/// extracted from it, is deleted when this value is dropped.
#[derive(Debug)]
pub struct StagedPayload {
    staging: TempDir,
    root: PathBuf,
    version: Version,
}

impl StagedPayload {
    /// Directory containing the payload marker.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Attempt-scoped staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Version being installed.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }
}

/// Downloads and stages release archives.
pub struct PackageFetcher {
    source: Arc<dyn ReleaseSource>,
    scratch_dir: Option<PathBuf>,
}

impl PackageFetcher {
    /// Create a fetcher that stages into the system temp directory.
    #[must_use]
    pub fn new(source: Arc<dyn ReleaseSource>) -> Self {
        Self {
            source,
            scratch_dir: None,
        }
    }

    /// Create staging areas under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    fn new_staging_area(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("os-health-agent-staging-");
        match &self.scratch_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| Error::fs("creating", dir, e))?;
                builder
                    .tempdir_in(dir)
                    .map_err(|e| Error::fs("creating staging area in", dir, e))
            }
            None => builder
                .tempdir()
                .map_err(|e| Error::Filesystem(format!("creating staging area: {e}"))),
        }
    }

    /// Download the release archive, verify it and extract it.
    ///
    /// Nothing outside the new staging area is written.
    ///
    /// # Errors
    ///
    /// - [`Error::Network`] if the download fails or times out
    /// - [`Error::Archive`] if the archive is corrupt or fails its checksum
    /// - [`Error::SourceNotFound`] if the payload marker is not in the archive
    pub async fn fetch<F>(
        &self,
        ctx: &UpdateContext,
        metadata: &ReleaseMetadata,
        target: &Version,
        progress: F,
    ) -> Result<StagedPayload>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        let archive = select_archive(metadata, &ctx.repository);
        info!("Downloading update from {}", archive.url);

        let staging = self.new_staging_area()?;
        let file_name = Path::new(&archive.name)
            .file_name()
            .map_or_else(|| "release-archive".into(), ToOwned::to_owned);
        let archive_path = staging.path().join(file_name);

        let mut file = tokio::fs::File::create(&archive_path)
            .await
            .map_err(|e| Error::fs("creating", &archive_path, e))?;
        let downloaded = self.source.download(&archive.url, &mut file, &progress).await?;
        file.flush()
            .await
            .map_err(|e| Error::fs("flushing", &archive_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::fs("syncing", &archive_path, e))?;
        drop(file);
        info!("Download completed: {} bytes", downloaded);

        let expected = self.expected_checksum(metadata, &archive.name).await?;

        let payload_dir = staging.path().join("payload");
        let marker = ctx.payload_marker.clone();
        let format = archive.format;
        let root = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            if let Some(expected) = expected {
                let (_, actual) = sha256_file(&archive_path)?;
                if !actual.eq_ignore_ascii_case(&expected) {
                    return Err(Error::Archive(format!(
                        "checksum mismatch: expected {expected}, got {actual}"
                    )));
                }
                debug!("Archive checksum verified");
            }
            verify_archive(&archive_path, format)?;
            extract_archive(&archive_path, format, &payload_dir)?;
            fs::remove_file(&archive_path).ok();
            locate_payload_root(&payload_dir, &marker)
        })
        .await
        .map_err(|e| Error::Filesystem(format!("staging task failed: {e}")))??;

        info!("Staged release {} at {}", target, root.display());
        Ok(StagedPayload {
            staging,
            root,
            version: target.clone(),
        })
    }

    async fn expected_checksum(
        &self,
        metadata: &ReleaseMetadata,
        archive_name: &str,
    ) -> Result<Option<String>> {
        let Some(asset) = metadata.checksums_asset() else {
            return Ok(None);
        };

        let mut listing = Vec::new();
        self.source
            .download(&asset.download_location, &mut listing, &|_: DownloadProgress| {})
            .await?;

        let expected = parse_checksums(&String::from_utf8_lossy(&listing), archive_name);
        if expected.is_none() {
            warn!("{} has no entry for {}", CHECKSUMS_ASSET, archive_name);
        }
        Ok(expected)
    }
}

/// Find the digest for `file_name` in a `sha256sum`-style listing.
#[must_use]
pub fn parse_checksums(listing: &str, file_name: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == file_name).then(|| digest.to_ascii_lowercase())
    })
}

fn archive_err(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Archive(format!("{}: {err}", path.display()))
}

/// Read every entry of the archive, checking its structure and checksums.
///
/// # Errors
///
/// Returns [`Error::Archive`] for corrupt, truncated or empty archives.
pub fn verify_archive(path: &Path, format: ArchiveFormat) -> Result<()> {
    let file = File::open(path).map_err(|e| archive_err(path, e))?;

    let entries = match format {
        ArchiveFormat::Zip => {
            let mut archive = zip::ZipArchive::new(file)?;
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                let name = entry.name().to_string();
                io::copy(&mut entry, &mut io::sink())
                    .map_err(|e| archive_err(path, format!("entry {name}: {e}")))?;
            }
            archive.len()
        }
        ArchiveFormat::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            let mut count = 0usize;
            for entry in archive.entries().map_err(|e| archive_err(path, e))? {
                let mut entry = entry.map_err(|e| archive_err(path, e))?;
                io::copy(&mut entry, &mut io::sink()).map_err(|e| archive_err(path, e))?;
                count += 1;
            }
            // Drain to the gzip trailer so its CRC is checked.
            let mut decoder = archive.into_inner();
            io::copy(&mut decoder, &mut io::sink()).map_err(|e| archive_err(path, e))?;
            count
        }
    };

    if entries == 0 {
        return Err(archive_err(path, "archive is empty"));
    }
    debug!("Verified archive {} ({} entries)", path.display(), entries);
    Ok(())
}

/// Extract `path` into `dest`, refusing entries that would land outside it.
///
/// # Errors
///
/// Returns [`Error::Archive`] if an entry cannot be extracted.
pub fn extract_archive(path: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| Error::fs("creating", dest, e))?;
    let file = File::open(path).map_err(|e| archive_err(path, e))?;

    match format {
        ArchiveFormat::Zip => {
            let mut archive = zip::ZipArchive::new(file)?;
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                let Some(relative) = entry.enclosed_name() else {
                    return Err(archive_err(
                        path,
                        format!("entry escapes staging area: {}", entry.name()),
                    ));
                };
                let out = dest.join(relative);

                if entry.is_dir() {
                    fs::create_dir_all(&out).map_err(|e| archive_err(&out, e))?;
                    continue;
                }
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent).map_err(|e| archive_err(parent, e))?;
                }
                let mut target = File::create(&out).map_err(|e| archive_err(&out, e))?;
                io::copy(&mut entry, &mut target).map_err(|e| archive_err(&out, e))?;

                #[cfg(unix)]
                if let Some(mode) = entry.unix_mode() {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))
                        .map_err(|e| archive_err(&out, e))?;
                }
            }
        }
        ArchiveFormat::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive.unpack(dest).map_err(|e| archive_err(path, e))?;
        }
    }
    Ok(())
}

/// Locate the directory that holds `marker`, preferring the shallowest match.
///
/// # Errors
///
/// Returns [`Error::SourceNotFound`] if no file matches `marker`.
pub fn locate_payload_root(dir: &Path, marker: &Path) -> Result<PathBuf> {
    let depth = marker.components().count();
    let mut best: Option<PathBuf> = None;

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Filesystem(format!("walking staging area: {e}")))?;
        if !entry.file_type().is_file() || !entry.path().ends_with(marker) {
            continue;
        }
        let Some(root) = entry.path().ancestors().nth(depth) else {
            continue;
        };
        let shallower = best
            .as_ref()
            .map_or(true, |b| root.components().count() < b.components().count());
        if shallower {
            best = Some(root.to_path_buf());
        }
    }

    best.ok_or_else(|| {
        Error::SourceNotFound(format!(
            "{} not found in release archive",
            marker.display()
        ))
    })
}
