//! Decides whether the latest remote release is newer than the installed one.

use crate::error::{Error, Result};
use crate::upgrade::source::{ReleaseMetadata, ReleaseSource};
use crate::upgrade::version::Version;
use crate::upgrade::UpdateContext;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Installed version is current (or the remote release was unusable).
    UpToDate,
    /// A newer release exists.
    Available {
        /// Parsed remote version.
        target: Version,
        /// Metadata the attempt will download from.
        metadata: ReleaseMetadata,
    },
}

impl Resolution {
    /// Whether an update should be installed.
    #[must_use]
    pub fn update_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    /// Metadata of the newer release, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&ReleaseMetadata> {
        match self {
            Self::Available { metadata, .. } => Some(metadata),
            Self::UpToDate => None,
        }
    }
}

/// Resolves the latest release of a repository against the installed version.
pub struct VersionResolver {
    source: Arc<dyn ReleaseSource>,
}

impl VersionResolver {
    /// Create a resolver backed by `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ReleaseSource>) -> Self {
        Self { source }
    }

    /// Query the source and compare against `ctx.current_version`.
    ///
    /// Malformed metadata or an unparsable tag is logged and reported as
    /// [`Resolution::UpToDate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the metadata cannot be fetched.
    pub async fn resolve(&self, ctx: &UpdateContext) -> Result<Resolution> {
        debug!("Checking for updates from {}", ctx.repository);

        match self.source.latest_release(&ctx.repository).await {
            Ok(metadata) => Ok(Self::evaluate(&ctx.current_version, metadata)),
            Err(Error::Parse(reason)) => {
                warn!("Ignoring malformed release metadata: {}", reason);
                Ok(Resolution::UpToDate)
            }
            Err(e) => Err(e),
        }
    }

    /// Compare a fetched release with `current`.
    #[must_use]
    pub fn evaluate(current: &Version, metadata: ReleaseMetadata) -> Resolution {
        let target = match Version::parse(&metadata.tag_name) {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring release with unparsable tag {:?}: {}", metadata.tag_name, e);
                return Resolution::UpToDate;
            }
        };

        info!("Current version: {}, latest version: {}", current, target);

        if target > *current {
            info!("Update available: {} -> {}", current, target);
            Resolution::Available { target, metadata }
        } else {
            debug!("Already on latest version");
            Resolution::UpToDate
        }
    }
}
