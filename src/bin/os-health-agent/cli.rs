//! Command-line interface definition.

use clap::{Parser, Subcommand, ValueEnum};
use os_health_agent::AgentConfig;
use std::path::PathBuf;

/// OS health monitoring agent with self-update.
#[derive(Parser, Debug)]
#[command(name = "os-health-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// What to do (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Root directory of the live installation.
    #[arg(long, global = true, env = "HEALTH_AGENT_INSTALL_DIR")]
    pub install_dir: Option<PathBuf>,

    /// GitHub repository to take releases from (owner/repo).
    #[arg(long, global = true, env = "HEALTH_AGENT_GITHUB_REPO")]
    pub repository: Option<String>,

    /// Seconds between update checks.
    #[arg(long, global = true, env = "HEALTH_AGENT_UPDATE_INTERVAL")]
    pub update_interval: Option<u64>,

    /// Seconds between health reports.
    #[arg(long, global = true, env = "HEALTH_AGENT_REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Dashboard URL reports are sent to.
    #[arg(long, global = true, env = "HEALTH_AGENT_DASHBOARD_URL")]
    pub dashboard_url: Option<String>,

    /// Disable the background update loop.
    #[arg(long, global = true)]
    pub no_auto_update: bool,

    /// How to restart after an update is installed.
    #[arg(long, global = true, value_enum, default_value = "exec")]
    pub restart_mode: RestartMode,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Path to configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the monitoring and update loops until interrupted.
    Run,
    /// Check once for a newer release and print the result.
    Check,
    /// Restore the installation from a backup snapshot.
    Rollback {
        /// Snapshot directory to restore (most recent when omitted).
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// List backup snapshots.
    Backups {
        /// Delete all but the newest N snapshots.
        #[arg(long, value_name = "N")]
        prune: Option<usize>,
    },
}

/// Restart strategy CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RestartMode {
    /// Re-execute the agent in place.
    Exec,
    /// Exit and let the service manager start the new version.
    Exit,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Build the agent configuration: file (or defaults), then CLI and
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<AgentConfig> {
        let mut config = if let Some(ref path) = self.config {
            AgentConfig::from_file(path)?
        } else {
            AgentConfig::default()
        };

        if let Some(ref install_dir) = self.install_dir {
            config.install_dir = install_dir.clone();
        }
        if let Some(ref repository) = self.repository {
            config.upgrade.repository = repository.clone();
        }
        if let Some(secs) = self.update_interval {
            config.upgrade.check_interval_secs = secs;
        }
        if let Some(secs) = self.report_interval {
            config.monitor.report_interval_secs = secs;
        }
        if self.dashboard_url.is_some() {
            config.monitor.dashboard_url = self.dashboard_url.clone();
        }
        if self.no_auto_update {
            config.upgrade.enabled = false;
        }
        config.log_level = self.log_level.clone();

        Ok(config)
    }
}
