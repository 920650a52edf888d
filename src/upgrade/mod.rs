//! Self-update pipeline.
//!
//! This module handles:
//! - Polling GitHub releases for a newer version
//! - Downloading and staging the release archive
//! - Snapshotting the live installation before it is touched
//! - Replacing tracked files atomically, with the version marker as commit point
//! - Rolling back from the snapshot when an install fails partway
//!
//! ```text
//! Idle → Checking ─(up to date)→ Idle
//!           │
//!           └→ Downloading → Staged → BackedUp → Installing → Committed → restart
//!                   │           │                    │
//!                   └───────────┴──→ Failed ←────────┤ (nothing replaced yet)
//!                                                    └→ Failed → RolledBack
//! ```

mod backup;
mod fetch;
mod fsops;
mod install;
mod resolver;
mod rollback;
mod scheduler;
mod source;
mod supervisor;
mod version;

pub use backup::{BackupManager, BackupSnapshot, SnapshotEntry, SnapshotManifest, SNAPSHOT_MANIFEST};
pub use fetch::{
    extract_archive, locate_payload_root, parse_checksums, select_archive, verify_archive,
    ArchiveFormat, ArchiveSource, PackageFetcher, StagedPayload,
};
pub use fsops::{atomic_copy, atomic_write, sha256_file};
pub use install::{AtomicReplace, Installer, ReplaceFile};
pub use resolver::{Resolution, VersionResolver};
pub use rollback::RollbackController;
pub use scheduler::{AttemptRecord, UpdateScheduler};
pub use source::{
    DownloadProgress, GithubReleaseSource, ReleaseAsset, ReleaseMetadata, ReleaseSource,
    CHECKSUMS_ASSET,
};
pub use supervisor::{
    ExecSupervisor, Invocation, ProcessSupervisor, ServiceManagerSupervisor, RESTART_EXIT_CODE,
};
pub use version::{strip_tag_prefix, Version};

use crate::config::{
    check_version_file_untracked, normalize_relative, validate_relative, AgentConfig,
};
use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// State of an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    /// Waiting for the next interval.
    Idle,
    /// Querying release metadata.
    Checking,
    /// Downloading and extracting the archive.
    Downloading,
    /// Payload extracted and located.
    Staged,
    /// Snapshot of the live installation complete.
    BackedUp,
    /// Replacing live files.
    Installing,
    /// Version marker written; the new version is live.
    Committed,
    /// Attempt abandoned.
    Failed,
    /// Attempt abandoned and live files restored from the snapshot.
    RolledBack,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Staged => "staged",
            Self::BackedUp => "backed-up",
            Self::Installing => "installing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Result of one scheduler trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another attempt was in flight; this trigger was dropped.
    Skipped,
    /// Installed version is current.
    NoUpdate,
    /// New version installed.
    Committed {
        /// The new version.
        version: Version,
        /// Snapshot taken before the install.
        snapshot: PathBuf,
    },
    /// Attempt abandoned; live files were not modified, or could not be restored.
    Failed {
        /// State the attempt was in when it failed.
        stage: UpdateState,
        /// Error that ended the attempt.
        reason: String,
    },
    /// Attempt abandoned after a partial install; live files restored.
    RolledBack {
        /// Error that caused the rollback.
        reason: String,
        /// Snapshot restored from.
        snapshot: PathBuf,
    },
}

impl UpdateOutcome {
    /// Terminal state of the attempt.
    #[must_use]
    pub fn final_state(&self) -> UpdateState {
        match self {
            Self::Skipped | Self::NoUpdate => UpdateState::Idle,
            Self::Committed { .. } => UpdateState::Committed,
            Self::Failed { .. } => UpdateState::Failed,
            Self::RolledBack { .. } => UpdateState::RolledBack,
        }
    }

    /// Whether the attempt installed a new version.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// The fixed set of files that make up the versioned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallManifest {
    files: Vec<PathBuf>,
}

impl InstallManifest {
    /// Build a manifest from paths relative to the install root.
    ///
    /// Paths are normalized and duplicates dropped; order is otherwise kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the list is empty or a path escapes the root.
    pub fn new(files: Vec<PathBuf>) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::Config("install manifest is empty".to_string()));
        }
        let mut unique: Vec<PathBuf> = Vec::with_capacity(files.len());
        for file in files {
            validate_relative(&file)?;
            let file = normalize_relative(&file);
            if !unique.contains(&file) {
                unique.push(file);
            }
        }
        Ok(Self { files: unique })
    }

    /// Tracked paths.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    /// Number of tracked files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always false for a constructed manifest.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Everything one update attempt needs, fixed when the attempt starts.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    /// Root of the live installation.
    pub install_dir: PathBuf,
    /// Tracked files.
    pub manifest: InstallManifest,
    /// Version marker, relative to `install_dir`.
    pub version_file: PathBuf,
    /// File that marks the payload root inside the archive.
    pub payload_marker: PathBuf,
    /// Repository releases are fetched from.
    pub repository: String,
    /// Installed version at attempt start.
    pub current_version: Version,
}

impl UpdateContext {
    /// Build the context for a new attempt, reading the installed version
    /// from the marker file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the manifest or marker paths are invalid.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let upgrade = &config.upgrade;
        let manifest = InstallManifest::new(upgrade.tracked_files.clone())?;
        let payload_marker = upgrade
            .payload_marker()
            .map(normalize_relative)
            .ok_or_else(|| Error::Config("no payload marker configured".to_string()))?;
        validate_relative(&upgrade.version_file)?;
        check_version_file_untracked(&upgrade.tracked_files, &upgrade.version_file)?;
        let version_file = normalize_relative(&upgrade.version_file);

        let current_version = installed_version(&config.install_dir, &version_file);

        Ok(Self {
            install_dir: config.install_dir.clone(),
            manifest,
            version_file,
            payload_marker,
            repository: upgrade.repository.clone(),
            current_version,
        })
    }

    /// Absolute path of the version marker.
    #[must_use]
    pub fn version_marker_path(&self) -> PathBuf {
        self.install_dir.join(&self.version_file)
    }

    /// Paths covered by snapshots: every tracked file, then the version marker.
    #[must_use]
    pub fn snapshot_paths(&self) -> Vec<PathBuf> {
        self.manifest
            .iter()
            .map(Path::to_path_buf)
            .chain(std::iter::once(self.version_file.clone()))
            .collect()
    }
}

/// Read the installed version from the marker file.
///
/// Falls back to the running build's version when the marker is missing or
/// unparsable.
#[must_use]
pub fn installed_version(install_dir: &Path, version_file: &Path) -> Version {
    let path = install_dir.join(version_file);
    match std::fs::read_to_string(&path) {
        Ok(content) => Version::parse(content.trim()).unwrap_or_else(|e| {
            warn!("Unreadable version marker {}: {}", path.display(), e);
            Version::build()
        }),
        Err(_) => Version::build(),
    }
}
