//! Copies a staged payload over the live installation.
//!
//! Tracked files are replaced one at a time, each atomically. The version
//! marker is written last and is the commit point: until it changes, the
//! installed version is still the old one.

use crate::error::{Error, Result};
use crate::upgrade::fsops::{atomic_copy, atomic_write};
use crate::upgrade::UpdateContext;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Writes into the live tree: tracked files, then the version marker.
pub trait ReplaceFile: Send + Sync {
    /// Replace `target` with the content of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement fails; `target` must be unchanged.
    fn replace(&self, source: &Path, target: &Path) -> Result<()>;

    /// Atomically set the version marker at `marker` to `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; `marker` must be unchanged.
    fn write_marker(&self, marker: &Path, version: &str) -> Result<()> {
        atomic_write(marker, version.as_bytes())
    }
}

/// Default replacement: temp file beside the target, then rename.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicReplace;

impl ReplaceFile for AtomicReplace {
    fn replace(&self, source: &Path, target: &Path) -> Result<()> {
        atomic_copy(source, target)
    }
}

/// Installs staged payloads into the live tree.
#[derive(Clone)]
pub struct Installer {
    replacer: Arc<dyn ReplaceFile>,
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer").finish_non_exhaustive()
    }
}

impl Installer {
    /// Installer using [`AtomicReplace`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            replacer: Arc::new(AtomicReplace),
        }
    }

    /// Installer using a custom replacement strategy.
    #[must_use]
    pub fn with_replacer(replacer: Arc<dyn ReplaceFile>) -> Self {
        Self { replacer }
    }

    /// Copy every tracked file from `payload_root` into `ctx.install_dir`,
    /// then write `version` to the version marker.
    ///
    /// `version` is written as given, normally the release tag without its
    /// `v` prefix.
    ///
    /// Files in the install dir that are not tracked are never touched.
    ///
    /// # Errors
    ///
    /// - [`Error::SourceNotFound`] if a tracked file is missing from the
    ///   payload; nothing has been written
    /// - [`Error::Filesystem`] if the first replacement fails; nothing has
    ///   been written
    /// - [`Error::PartialInstall`] if a later replacement or the marker
    ///   write fails; the live tree is mixed and must be rolled back
    pub fn install(&self, payload_root: &Path, ctx: &UpdateContext, version: &str) -> Result<()> {
        for rel in ctx.manifest.iter() {
            let staged = payload_root.join(rel);
            if !staged.is_file() {
                return Err(Error::SourceNotFound(format!(
                    "release payload has no {}",
                    rel.display()
                )));
            }
        }

        let total = ctx.manifest.len() + 1;
        info!(
            "Installing version {} into {} ({} files)",
            version,
            ctx.install_dir.display(),
            ctx.manifest.len()
        );

        for (replaced, rel) in ctx.manifest.iter().enumerate() {
            let staged = payload_root.join(rel);
            let live = ctx.install_dir.join(rel);
            debug!("Replacing {}", live.display());

            if let Err(e) = self.replacer.replace(&staged, &live) {
                warn!("Failed to replace {}: {}", live.display(), e);
                if replaced == 0 {
                    return Err(e);
                }
                return Err(Error::PartialInstall {
                    replaced,
                    total,
                    reason: e.to_string(),
                });
            }
        }

        let marker = ctx.version_marker_path();
        self.replacer
            .write_marker(&marker, version)
            .map_err(|e| Error::PartialInstall {
                replaced: total - 1,
                total,
                reason: format!("writing version marker: {e}"),
            })?;

        info!("Version {} installed", version);
        Ok(())
    }
}
