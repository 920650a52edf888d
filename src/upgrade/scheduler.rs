//! Drives update attempts on a fixed interval.
//!
//! Each trigger runs one attempt through the state machine described in the
//! module docs of [`crate::upgrade`]. Triggers that arrive while an attempt
//! is in flight are dropped. No failure escapes [`UpdateScheduler::trigger`];
//! it is recorded, logged and reported on the event channel.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::event::{AgentEvent, AgentEventsSender};
use crate::upgrade::backup::{BackupManager, BackupSnapshot};
use crate::upgrade::fetch::PackageFetcher;
use crate::upgrade::install::Installer;
use crate::upgrade::resolver::{Resolution, VersionResolver};
use crate::upgrade::rollback::RollbackController;
use crate::upgrade::source::{DownloadProgress, ReleaseSource};
use crate::upgrade::supervisor::{Invocation, ProcessSupervisor};
use crate::upgrade::version::strip_tag_prefix;
use crate::upgrade::{UpdateContext, UpdateOutcome, UpdateState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Summary of the most recent finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub finished_at: DateTime<Utc>,
    /// How it ended.
    pub outcome: UpdateOutcome,
}

/// Releases the in-flight flag when an attempt ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one blocking filesystem step off the async workers.
async fn blocking<T, F>(step: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Filesystem(format!("{step} task failed: {e}")))?
}

/// Periodic, single-flight update orchestrator.
pub struct UpdateScheduler {
    config: Arc<AgentConfig>,
    source: Arc<dyn ReleaseSource>,
    supervisor: Arc<dyn ProcessSupervisor>,
    invocation: Invocation,
    installer: Installer,
    scratch_dir: Option<PathBuf>,
    events: AgentEventsSender,
    in_flight: AtomicBool,
    stopping: AtomicBool,
    last_attempt: Mutex<Option<AttemptRecord>>,
}

impl UpdateScheduler {
    /// Create a scheduler.
    ///
    /// `invocation` is what the supervisor re-executes after a commit; it
    /// must be captured before any binary is replaced.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        source: Arc<dyn ReleaseSource>,
        supervisor: Arc<dyn ProcessSupervisor>,
        invocation: Invocation,
        events: AgentEventsSender,
    ) -> Self {
        Self {
            config,
            source,
            supervisor,
            invocation,
            installer: Installer::new(),
            scratch_dir: None,
            events,
            in_flight: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
        }
    }

    /// Use a custom installer.
    #[must_use]
    pub fn with_installer(mut self, installer: Installer) -> Self {
        self.installer = installer;
        self
    }

    /// Stage downloads under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    /// Whether an attempt is currently running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The last finished attempt, if any.
    #[must_use]
    pub fn last_attempt(&self) -> Option<AttemptRecord> {
        self.last_attempt.lock().clone()
    }

    /// Interval between triggers.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.upgrade.check_interval_secs)
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn enter(&self, state: UpdateState) {
        info!("Update attempt: {}", state);
        self.emit(AgentEvent::UpdateStateChanged { state });
    }

    fn fail(&self, stage: UpdateState, err: &Error) -> UpdateOutcome {
        if err.is_transient() {
            warn!("Update failed while {}: {} (retrying next interval)", stage, err);
        } else {
            error!("Update failed while {}: {}", stage, err);
        }
        self.enter(UpdateState::Failed);
        self.emit(AgentEvent::UpdateFailed {
            stage,
            message: err.to_string(),
        });
        UpdateOutcome::Failed {
            stage,
            reason: err.to_string(),
        }
    }

    /// Resolve the latest release without installing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the metadata
    /// cannot be fetched.
    pub async fn check(&self) -> Result<Resolution> {
        let ctx = UpdateContext::from_config(&self.config)?;
        VersionResolver::new(Arc::clone(&self.source))
            .resolve(&ctx)
            .await
    }

    /// Run one update attempt now.
    ///
    /// Returns [`UpdateOutcome::Skipped`] immediately if another attempt is
    /// in flight. On a commit the supervisor is asked to restart the process;
    /// if that succeeds this never returns.
    pub async fn trigger(&self) -> UpdateOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Update attempt already in progress, dropping trigger");
            return UpdateOutcome::Skipped;
        };

        let started_at = Utc::now();
        let outcome = self.attempt().await;
        *self.last_attempt.lock() = Some(AttemptRecord {
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.clone(),
        });

        // Held through the restart so no new attempt starts under exec.
        if outcome.is_committed() {
            self.restart();
        }
        drop(guard);
        outcome
    }

    fn restart(&self) {
        if self.stopping.load(Ordering::Acquire) {
            info!("Shutting down; the new version loads on the next start");
            return;
        }
        info!("Restarting to load the new version");
        self.emit(AgentEvent::Restarting);
        if let Err(e) = self.supervisor.restart_in_place(&self.invocation) {
            // The new version is on disk and will load on the next start.
            error!("Restart failed: {}", e);
            self.emit(AgentEvent::Error {
                message: format!("restart failed: {e}"),
            });
        }
    }

    async fn attempt(&self) -> UpdateOutcome {
        self.enter(UpdateState::Checking);
        let ctx = match UpdateContext::from_config(&self.config) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(UpdateState::Checking, &e),
        };

        let resolution = match VersionResolver::new(Arc::clone(&self.source))
            .resolve(&ctx)
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => return self.fail(UpdateState::Checking, &e),
        };
        let Resolution::Available { target, metadata } = resolution else {
            self.enter(UpdateState::Idle);
            return UpdateOutcome::NoUpdate;
        };
        self.emit(AgentEvent::UpdateAvailable {
            current: ctx.current_version.to_string(),
            version: target.to_string(),
        });

        self.enter(UpdateState::Downloading);
        let mut fetcher = PackageFetcher::new(Arc::clone(&self.source));
        if let Some(dir) = &self.scratch_dir {
            fetcher = fetcher.with_scratch_dir(dir.clone());
        }
        let events = self.events.clone();
        let progress = move |p: DownloadProgress| {
            let _ = events.send(AgentEvent::DownloadProgress {
                downloaded: p.downloaded,
                total: p.total,
            });
        };
        let staged = match fetcher.fetch(&ctx, &metadata, &target, progress).await {
            Ok(staged) => staged,
            Err(e) => return self.fail(UpdateState::Downloading, &e),
        };
        self.enter(UpdateState::Staged);

        let backups = match BackupManager::for_install(&ctx.install_dir) {
            Ok(backups) => backups,
            Err(e) => return self.fail(UpdateState::Staged, &e),
        };
        let snapshot = {
            let (backups, ctx) = (backups.clone(), ctx.clone());
            match blocking("backup", move || backups.create(&ctx)).await {
                Ok(snapshot) => snapshot,
                Err(e) => return self.fail(UpdateState::Staged, &e),
            }
        };
        self.enter(UpdateState::BackedUp);

        self.enter(UpdateState::Installing);
        let installed = {
            let installer = self.installer.clone();
            let root = staged.root().to_path_buf();
            let ctx = ctx.clone();
            let version = strip_tag_prefix(&metadata.tag_name).to_string();
            blocking("install", move || installer.install(&root, &ctx, &version)).await
        };
        drop(staged);

        match installed {
            Ok(()) => {
                self.enter(UpdateState::Committed);
                self.emit(AgentEvent::UpgradeComplete {
                    version: target.to_string(),
                });
                self.prune(&backups, &snapshot).await;
                UpdateOutcome::Committed {
                    version: target,
                    snapshot: snapshot.path().to_path_buf(),
                }
            }
            Err(e) if e.mutated_live_install() => self.roll_back(&ctx, snapshot, &e).await,
            Err(e) => self.fail(UpdateState::Installing, &e),
        }
    }

    async fn roll_back(
        &self,
        ctx: &UpdateContext,
        snapshot: BackupSnapshot,
        cause: &Error,
    ) -> UpdateOutcome {
        let failed = self.fail(UpdateState::Installing, cause);

        let controller = RollbackController::from_context(ctx);
        let path = snapshot.path().to_path_buf();
        match blocking("rollback", move || controller.restore(&snapshot)).await {
            Ok(()) => {
                self.enter(UpdateState::RolledBack);
                self.emit(AgentEvent::RolledBack {
                    snapshot: path.clone(),
                });
                UpdateOutcome::RolledBack {
                    reason: cause.to_string(),
                    snapshot: path,
                }
            }
            Err(e) => {
                error!(
                    "Rollback from {} failed, installation needs manual recovery: {}",
                    path.display(),
                    e
                );
                self.emit(AgentEvent::Error {
                    message: format!("rollback failed: {e}"),
                });
                match failed {
                    UpdateOutcome::Failed { stage, reason } => UpdateOutcome::Failed {
                        stage,
                        reason: format!("{reason}; rollback failed: {e}"),
                    },
                    other => other,
                }
            }
        }
    }

    async fn prune(&self, backups: &BackupManager, snapshot: &BackupSnapshot) {
        let keep = self.config.upgrade.keep_backups;
        let backups = backups.clone();
        let protect = snapshot.path().to_path_buf();
        match blocking("prune", move || backups.prune(keep, Some(&protect))).await {
            Ok(removed) if !removed.is_empty() => info!("Pruned {} old backups", removed.len()),
            Ok(_) => {}
            Err(e) => warn!("Failed to prune backups: {}", e),
        }
    }

    /// Trigger an attempt every check interval until `shutdown` flips to true.
    ///
    /// Each tick runs in its own task, so a slow attempt never delays the
    /// tick after it; that tick is simply dropped by the single-flight guard.
    /// On shutdown, an attempt in flight is awaited to completion (including
    /// any rollback) before this returns, and no restart is requested.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Update scheduler started, checking every {}s",
            self.config.upgrade.check_interval_secs
        );

        let mut attempts = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = attempts.join_next() => {
                    if let Err(e) = joined {
                        error!("Update attempt task failed: {}", e);
                    }
                }
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    attempts.spawn(async move {
                        let outcome = scheduler.trigger().await;
                        debug!("Update attempt finished: {}", outcome.final_state());
                    });
                }
            }
        }

        self.stopping.store(true, Ordering::Release);
        if !attempts.is_empty() {
            info!("Waiting for the update attempt in flight to finish");
        }
        while let Some(joined) = attempts.join_next().await {
            if let Err(e) = joined {
                error!("Update attempt task failed: {}", e);
            }
        }
        info!("Update scheduler stopped");
    }
}
