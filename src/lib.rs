//! # os-health-agent
//!
//! A long-running OS health monitoring agent that keeps itself up to date.
//!
//! Two loops run side by side:
//! - the monitoring loop, which hands a health report to a [`HealthReporter`]
//!   every report interval
//! - the update loop, which polls GitHub releases and, when a newer version
//!   is published, downloads it, snapshots the live installation, replaces
//!   the tracked files atomically and restarts the process in place
//!
//! A failed update never stops the agent. If the install fails after live
//! files were touched, the snapshot is restored before the next interval.
//!
//! ## Example
//!
//! ```no_run
//! use os_health_agent::{AgentBuilder, AgentConfig};
//!
//! # async fn example() -> os_health_agent::Result<()> {
//! let mut config = AgentConfig::default();
//! config.upgrade.repository = "acme/os-health-agent".to_string();
//!
//! let mut agent = AgentBuilder::new(config).build()?;
//! agent.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod upgrade;

pub use agent::{AgentBuilder, RunningAgent};
pub use config::{AgentConfig, MonitorConfig, UpgradeConfig};
pub use error::{Error, Result};
pub use event::{create_event_channel, AgentEvent, AgentEventsChannel, AgentEventsSender};
pub use monitor::{HealthReporter, HeartbeatReporter};
pub use upgrade::{
    BackupManager, BackupSnapshot, Installer, ProcessSupervisor, ReleaseSource,
    RollbackController, UpdateContext, UpdateOutcome, UpdateScheduler, UpdateState, Version,
};
