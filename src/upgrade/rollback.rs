//! Restores the live installation from a backup snapshot.

use crate::error::{Error, Result};
use crate::upgrade::backup::{BackupManager, BackupSnapshot};
use crate::upgrade::fsops::atomic_copy;
use crate::upgrade::UpdateContext;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Puts snapshot content back over the live tree.
#[derive(Debug, Clone)]
pub struct RollbackController {
    install_dir: PathBuf,
}

impl RollbackController {
    /// Controller for the installation rooted at `install_dir`.
    #[must_use]
    pub fn new(install_dir: PathBuf) -> Self {
        Self { install_dir }
    }

    /// Controller for the installation an attempt is working on.
    #[must_use]
    pub fn from_context(ctx: &UpdateContext) -> Self {
        Self::new(ctx.install_dir.clone())
    }

    /// Root being restored.
    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Restore every file recorded in `snapshot`.
    ///
    /// The snapshot is verified against its manifest before any live file is
    /// touched. Files the snapshot recorded as absent are removed. Every file
    /// is attempted even after a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollback`] if the snapshot fails verification (live
    /// tree untouched) or if any file could not be restored.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<()> {
        snapshot.verify().map_err(|e| {
            Error::Rollback(format!(
                "snapshot {} is damaged: {e}",
                snapshot.path().display()
            ))
        })?;

        info!(
            "Rolling back {} to version {} from {}",
            self.install_dir.display(),
            snapshot.version(),
            snapshot.path().display()
        );

        let manifest = snapshot.manifest();
        let mut failures = Vec::new();

        for entry in &manifest.files {
            let copy = snapshot.path().join(&entry.path);
            let live = self.install_dir.join(&entry.path);
            if let Err(e) = atomic_copy(&copy, &live) {
                error!("Failed to restore {}: {}", live.display(), e);
                failures.push(format!("{}: {e}", entry.path.display()));
            }
        }

        for rel in &manifest.absent {
            let live = self.install_dir.join(rel);
            match fs::remove_file(&live) {
                Ok(()) => info!("Removed {} (absent before the update)", live.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!("Failed to remove {}: {}", live.display(), e);
                    failures.push(format!("{}: {e}", rel.display()));
                }
            }
        }

        if failures.is_empty() {
            info!("Rollback to version {} complete", snapshot.version());
            Ok(())
        } else {
            Err(Error::Rollback(format!(
                "{} of {} files not restored: {}",
                failures.len(),
                manifest.files.len() + manifest.absent.len(),
                failures.join("; ")
            )))
        }
    }

    /// Restore from the most recent snapshot `backups` knows of.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollback`] if no snapshot exists or restoring fails.
    pub fn restore_latest(&self, backups: &BackupManager) -> Result<BackupSnapshot> {
        let Some(snapshot) = backups.latest()? else {
            warn!("No backup found in {}", backups.backup_root().display());
            return Err(Error::Rollback(format!(
                "no backup found in {}",
                backups.backup_root().display()
            )));
        };
        self.restore(&snapshot)?;
        Ok(snapshot)
    }
}
