//! Configuration for os-health-agent.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Root directory of the live installation.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Monitoring loop configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Self-update configuration.
    #[serde(default)]
    pub upgrade: UpgradeConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Monitoring loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between health reports.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Dashboard base URL reports are sent to.
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

/// Self-update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Enable the background update loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// GitHub repository (owner/repo format).
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Base URL of the releases API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Check interval in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Timeout applied to every remote call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Files, relative to `install_dir`, that make up the versioned payload.
    #[serde(default = "default_tracked_files")]
    pub tracked_files: Vec<PathBuf>,

    /// Version marker file, relative to `install_dir`.
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,

    /// File whose presence marks the payload root inside a release archive.
    ///
    /// Defaults to the first tracked file.
    #[serde(default)]
    pub payload_marker: Option<PathBuf>,

    /// Number of backup snapshots to keep (0 keeps all of them).
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            monitor: MonitorConfig::default(),
            upgrade: UpgradeConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
            dashboard_url: None,
        }
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repository: default_repository(),
            api_base_url: default_api_base_url(),
            check_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
            tracked_files: default_tracked_files(),
            version_file: default_version_file(),
            payload_marker: None,
            keep_backups: default_keep_backups(),
        }
    }
}

impl UpgradeConfig {
    /// The payload marker, falling back to the first tracked file.
    #[must_use]
    pub fn payload_marker(&self) -> Option<&Path> {
        self.payload_marker
            .as_deref()
            .or_else(|| self.tracked_files.first().map(PathBuf::as_path))
    }
}

fn default_install_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "os-health-agent")
        .map(|dirs| dirs.data_dir().join("current"))
        .unwrap_or_else(|| PathBuf::from(".os-health-agent/current"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}

fn default_repository() -> String {
    "os-health-agent/os-health-agent".to_string()
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

const fn default_report_interval() -> u64 {
    300 // 5 minutes
}

const fn default_check_interval() -> u64 {
    3600 // 1 hour
}

const fn default_request_timeout() -> u64 {
    10
}

fn default_tracked_files() -> Vec<PathBuf> {
    vec![PathBuf::from(format!(
        "os-health-agent{}",
        std::env::consts::EXE_SUFFIX
    ))]
}

fn default_version_file() -> PathBuf {
    PathBuf::from("version.txt")
}

const fn default_keep_backups() -> usize {
    5
}

/// Check that a manifest path stays inside the install root.
pub(crate) fn validate_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Config("empty path in manifest".to_string()));
    }
    if !path.components().any(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::Config(format!(
            "path does not name a file: {}",
            path.display()
        )));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Config(format!(
                    "path must be relative to the install dir: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Drop `.` components so equal paths compare equal (`./a/b` → `a/b`).
pub(crate) fn normalize_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Reject a version file that is also a tracked file.
pub(crate) fn check_version_file_untracked(
    tracked_files: &[PathBuf],
    version_file: &Path,
) -> Result<()> {
    let version_file = normalize_relative(version_file);
    if tracked_files
        .iter()
        .any(|path| normalize_relative(path) == version_file)
    {
        return Err(Error::Config(format!(
            "version file {} must not also be a tracked file",
            version_file.display()
        )));
    }
    Ok(())
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the update pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.report_interval_secs == 0 {
            return Err(Error::Config("report interval must be non-zero".to_string()));
        }

        let upgrade = &self.upgrade;
        if upgrade.check_interval_secs == 0 {
            return Err(Error::Config("check interval must be non-zero".to_string()));
        }
        if upgrade.request_timeout_secs == 0 {
            return Err(Error::Config("request timeout must be non-zero".to_string()));
        }
        if upgrade.repository.trim().is_empty() || !upgrade.repository.contains('/') {
            return Err(Error::Config(format!(
                "repository must be in owner/repo format, got {:?}",
                upgrade.repository
            )));
        }
        if upgrade.tracked_files.is_empty() {
            return Err(Error::Config("tracked_files must not be empty".to_string()));
        }
        for path in &upgrade.tracked_files {
            validate_relative(path)?;
        }
        validate_relative(&upgrade.version_file)?;
        check_version_file_untracked(&upgrade.tracked_files, &upgrade.version_file)?;
        if let Some(marker) = &upgrade.payload_marker {
            validate_relative(marker)?;
        }
        Ok(())
    }
}
