//! Agent event system.
//!
//! Observers subscribe to a broadcast channel; the update scheduler reports
//! every attempt state transition and failure through it.

use crate::upgrade::UpdateState;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Events emitted by the agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Agent has started successfully.
    Started,

    /// Agent is shutting down.
    ShuttingDown,

    /// The monitoring loop produced a health report.
    ReportProduced {
        /// Monotonic report counter since start.
        sequence: u64,
    },

    /// A newer release was found.
    UpdateAvailable {
        /// Installed version.
        current: String,
        /// Newer version.
        version: String,
    },

    /// The update attempt moved to a new state.
    UpdateStateChanged {
        /// State entered.
        state: UpdateState,
    },

    /// Archive download progress.
    DownloadProgress {
        /// Bytes received so far.
        downloaded: u64,
        /// Total size, when the server sent one.
        total: Option<u64>,
    },

    /// Update committed; a restart follows.
    UpgradeComplete {
        /// New version.
        version: String,
    },

    /// An update attempt failed.
    UpdateFailed {
        /// State the attempt was in when it failed.
        stage: UpdateState,
        /// Error message.
        message: String,
    },

    /// Live files were restored from a snapshot.
    RolledBack {
        /// Snapshot the files came from.
        snapshot: PathBuf,
    },

    /// The process is about to be replaced.
    Restarting,

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving agent events.
pub type AgentEventsChannel = broadcast::Receiver<AgentEvent>;

/// Sender for agent events.
pub type AgentEventsSender = broadcast::Sender<AgentEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (AgentEventsSender, AgentEventsChannel) {
    broadcast::channel(256)
}
