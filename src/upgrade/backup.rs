//! Snapshots of the live installation taken before it is modified.
//!
//! A snapshot is a directory next to the install root named
//! `<install-dir-name>-backup-v<version>-<timestamp>`. It holds a copy of
//! every tracked file plus the version marker, and a `snapshot.toml`
//! manifest written last. A directory without the manifest is an interrupted
//! backup and is never restored from.

use crate::config::validate_relative;
use crate::error::{Error, Result};
use crate::upgrade::fsops::{atomic_write, sha256_file};
use crate::upgrade::version::Version;
use crate::upgrade::UpdateContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the manifest inside each snapshot directory.
pub const SNAPSHOT_MANIFEST: &str = "snapshot.toml";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// One file captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Path relative to the install root.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

/// Contents of `snapshot.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Version the snapshot was taken from.
    pub version: String,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Tracked files that did not exist when the snapshot was taken.
    #[serde(default)]
    pub absent: Vec<PathBuf>,
    /// Files copied into the snapshot.
    #[serde(default)]
    pub files: Vec<SnapshotEntry>,
}

/// A complete snapshot on disk.
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    path: PathBuf,
    version: Version,
    manifest: SnapshotManifest,
}

impl BackupSnapshot {
    /// Open a snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is missing, unreadable, or names
    /// paths outside the install root.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest_path = path.join(SNAPSHOT_MANIFEST);
        let content = fs::read_to_string(&manifest_path)
            .map_err(|e| Error::fs("reading snapshot manifest", &manifest_path, e))?;
        let manifest: SnapshotManifest = toml::from_str(&content)
            .map_err(|e| Error::Parse(format!("{}: {e}", manifest_path.display())))?;

        for rel in manifest.files.iter().map(|f| &f.path).chain(&manifest.absent) {
            validate_relative(rel)?;
        }
        let version = Version::parse(&manifest.version)?;

        Ok(Self {
            path: path.to_path_buf(),
            version,
            manifest,
        })
    }

    /// Snapshot directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version the snapshot was taken from.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    /// The parsed manifest.
    #[must_use]
    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    /// Re-read every file and compare it with the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if a file is missing, unreadable, or
    /// its content changed.
    pub fn verify(&self) -> Result<()> {
        for entry in &self.manifest.files {
            let copy = self.path.join(&entry.path);
            let (size, digest) = sha256_file(&copy)?;
            if size != entry.size || digest != entry.sha256 {
                return Err(Error::Filesystem(format!(
                    "snapshot file {} does not match its manifest",
                    copy.display()
                )));
            }
        }
        Ok(())
    }
}

/// Creates, lists and prunes snapshots for one install root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
    prefix: String,
}

impl BackupManager {
    /// Create a manager storing snapshots in `backup_root`, named after `prefix`.
    #[must_use]
    pub fn new(backup_root: PathBuf, prefix: impl Into<String>) -> Self {
        Self {
            backup_root,
            prefix: prefix.into(),
        }
    }

    /// Manager for snapshots kept alongside `install_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `install_dir` has no parent or name.
    pub fn for_install(install_dir: &Path) -> Result<Self> {
        let parent = install_dir.parent().ok_or_else(|| {
            Error::Config(format!(
                "install dir has no parent for backups: {}",
                install_dir.display()
            ))
        })?;
        let name = install_dir.file_name().ok_or_else(|| {
            Error::Config(format!("install dir has no name: {}", install_dir.display()))
        })?;
        Ok(Self::new(
            parent.to_path_buf(),
            name.to_string_lossy().into_owned(),
        ))
    }

    /// Directory snapshots are written to.
    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    fn name_prefix(&self) -> String {
        format!("{}-backup-v", self.prefix)
    }

    /// Snapshot every tracked file and the version marker of `ctx`.
    ///
    /// The snapshot is only returned once every copy has been re-read and
    /// matched against the live file's hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if any copy fails; the partial snapshot
    /// directory is removed.
    pub fn create(&self, ctx: &UpdateContext) -> Result<BackupSnapshot> {
        let created_at = Utc::now();
        let name = format!(
            "{}{}-{}",
            self.name_prefix(),
            ctx.current_version,
            created_at.format(TIMESTAMP_FORMAT)
        );
        let dir = self.backup_root.join(name);

        fs::create_dir_all(&self.backup_root)
            .map_err(|e| Error::fs("creating", &self.backup_root, e))?;
        fs::create_dir(&dir).map_err(|e| Error::fs("creating snapshot", &dir, e))?;

        info!("Creating backup at {}", dir.display());
        match Self::fill(ctx, &dir, created_at) {
            Ok(snapshot) => {
                info!(
                    "Backup created: {} files from version {}",
                    snapshot.manifest.files.len(),
                    snapshot.version
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Backup failed, removing {}: {}", dir.display(), e);
                fs::remove_dir_all(&dir).ok();
                Err(e)
            }
        }
    }

    fn fill(ctx: &UpdateContext, dir: &Path, created_at: DateTime<Utc>) -> Result<BackupSnapshot> {
        let mut files = Vec::new();
        let mut absent = Vec::new();

        for rel in ctx.snapshot_paths() {
            let live = ctx.install_dir.join(&rel);
            match fs::metadata(&live) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Tracked file absent, recording: {}", rel.display());
                    absent.push(rel);
                    continue;
                }
                Err(e) => return Err(Error::fs("reading metadata of", &live, e)),
                Ok(meta) if !meta.is_file() => {
                    return Err(Error::Filesystem(format!(
                        "tracked path is not a regular file: {}",
                        live.display()
                    )))
                }
                Ok(_) => {}
            }

            let copy = dir.join(&rel);
            if let Some(parent) = copy.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::fs("creating", parent, e))?;
            }
            fs::copy(&live, &copy).map_err(|e| Error::fs("backing up", &live, e))?;

            let (size, sha256) = sha256_file(&live)?;
            let (copy_size, copy_sha256) = sha256_file(&copy)?;
            if size != copy_size || sha256 != copy_sha256 {
                return Err(Error::Filesystem(format!(
                    "backup copy of {} does not match the live file",
                    live.display()
                )));
            }
            files.push(SnapshotEntry {
                path: rel,
                size,
                sha256,
            });
        }

        let manifest = SnapshotManifest {
            version: ctx.current_version.to_string(),
            created_at,
            absent,
            files,
        };
        let body = toml::to_string_pretty(&manifest)
            .map_err(|e| Error::Filesystem(format!("encoding snapshot manifest: {e}")))?;
        atomic_write(&dir.join(SNAPSHOT_MANIFEST), body.as_bytes())?;

        let snapshot = BackupSnapshot::open(dir)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Complete snapshots, oldest first.
    ///
    /// Interrupted snapshots (no manifest) are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup root cannot be read.
    pub fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::fs("reading", &self.backup_root, e)),
        };

        let prefix = self.name_prefix();
        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::fs("reading", &self.backup_root, e))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) || !entry.path().is_dir() {
                continue;
            }
            match BackupSnapshot::open(&entry.path()) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping incomplete backup {}: {}", entry.path().display(), e),
            }
        }

        snapshots.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(snapshots)
    }

    /// Most recent complete snapshot by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup root cannot be read.
    pub fn latest(&self) -> Result<Option<BackupSnapshot>> {
        Ok(self.list()?.pop())
    }

    /// Delete all but the newest `keep` snapshots; `keep == 0` keeps everything.
    ///
    /// `protect` is never deleted, whatever its age.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup root cannot be read or a snapshot
    /// cannot be removed.
    pub fn prune(&self, keep: usize, protect: Option<&Path>) -> Result<Vec<PathBuf>> {
        if keep == 0 {
            return Ok(Vec::new());
        }

        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for snapshot in snapshots.into_iter().take(excess) {
            if protect == Some(snapshot.path()) {
                continue;
            }
            info!("Pruning backup {}", snapshot.path().display());
            fs::remove_dir_all(snapshot.path())
                .map_err(|e| Error::fs("removing", snapshot.path(), e))?;
            removed.push(snapshot.path);
        }
        Ok(removed)
    }
}
