//! Restarting the agent once a new version is committed.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Program and arguments the agent was launched with.
///
/// Captured at startup, before any binary on disk is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable path.
    pub program: PathBuf,
    /// Arguments, excluding the program name.
    pub args: Vec<OsString>,
}

impl Invocation {
    /// Build an invocation explicitly.
    #[must_use]
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self { program, args }
    }

    /// The running process's invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Restart`] if the executable path cannot be determined.
    pub fn current() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Restart(format!("cannot locate current executable: {e}")))?;
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Restarts the agent process on the freshly installed version.
pub trait ProcessSupervisor: Send + Sync {
    /// Replace the running process with `invocation`.
    ///
    /// Implementations that succeed never return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Restart`] if the new process could not be started;
    /// the caller keeps running the old code.
    fn restart_in_place(&self, invocation: &Invocation) -> Result<()>;
}

/// Re-executes the captured invocation in the current process.
///
/// On Unix the process image is replaced with `exec`, keeping the pid. On
/// other platforms the new process is spawned and the current one exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecSupervisor;

impl ProcessSupervisor for ExecSupervisor {
    #[cfg(unix)]
    fn restart_in_place(&self, invocation: &Invocation) -> Result<()> {
        use std::os::unix::process::CommandExt;

        info!("Re-executing {}", invocation.program.display());
        let err = invocation.command().exec();
        warn!("exec failed: {}", err);
        Err(Error::Restart(format!(
            "exec {}: {err}",
            invocation.program.display()
        )))
    }

    #[cfg(not(unix))]
    fn restart_in_place(&self, invocation: &Invocation) -> Result<()> {
        info!("Spawning {}", invocation.program.display());
        invocation.command().spawn().map_err(|e| {
            Error::Restart(format!("spawn {}: {e}", invocation.program.display()))
        })?;
        std::process::exit(0);
    }
}

/// Default exit code asking a service manager to start the new version.
///
/// Non-zero so units with `Restart=on-failure` restart the agent.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Exits and leaves the restart to a service manager (systemd, launchd).
#[derive(Debug, Clone, Copy)]
pub struct ServiceManagerSupervisor {
    exit_code: i32,
}

impl ServiceManagerSupervisor {
    /// Exit with `exit_code` when a restart is requested.
    #[must_use]
    pub const fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }

    /// Code the process exits with.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl Default for ServiceManagerSupervisor {
    fn default() -> Self {
        Self::new(RESTART_EXIT_CODE)
    }
}

impl ProcessSupervisor for ServiceManagerSupervisor {
    fn restart_in_place(&self, _invocation: &Invocation) -> Result<()> {
        info!(
            "Exiting with code {} for the service manager to restart",
            self.exit_code
        );
        std::process::exit(self.exit_code);
    }
}
