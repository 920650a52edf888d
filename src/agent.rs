//! Agent wiring: the monitoring loop and the update scheduler side by side.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::event::{create_event_channel, AgentEvent, AgentEventsChannel, AgentEventsSender};
use crate::monitor::{run_monitor_loop, HealthReporter, HeartbeatReporter};
use crate::upgrade::{
    ExecSupervisor, GithubReleaseSource, Invocation, ProcessSupervisor, ReleaseSource,
    UpdateScheduler,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builder for constructing an agent.
pub struct AgentBuilder {
    config: AgentConfig,
    reporter: Option<Arc<dyn HealthReporter>>,
    source: Option<Arc<dyn ReleaseSource>>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    invocation: Option<Invocation>,
}

impl AgentBuilder {
    /// Create a new agent builder with the given configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            reporter: None,
            source: None,
            supervisor: None,
            invocation: None,
        }
    }

    /// Use a custom health reporter instead of the heartbeat logger.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Use a custom release source instead of the GitHub API.
    #[must_use]
    pub fn with_release_source(mut self, source: Arc<dyn ReleaseSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use a custom restart strategy instead of re-executing in place.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Restart with `invocation` instead of the current process's.
    #[must_use]
    pub fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.invocation = Some(invocation);
        self
    }

    /// Validate the configuration and assemble the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the install dir
    /// cannot be created, or the HTTP client cannot be built.
    pub fn build(self) -> Result<RunningAgent> {
        info!("Building os-health-agent with config: {:?}", self.config);
        self.config.validate()?;

        std::fs::create_dir_all(&self.config.install_dir)?;

        // Captured before any update can replace the binary.
        let invocation = match self.invocation {
            Some(invocation) => invocation,
            None => Invocation::current()?,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let source: Arc<dyn ReleaseSource> = match self.source {
            Some(source) => source,
            None => Arc::new(GithubReleaseSource::new(
                &self.config.upgrade.api_base_url,
                Duration::from_secs(self.config.upgrade.request_timeout_secs),
            )?),
        };
        let supervisor: Arc<dyn ProcessSupervisor> = self
            .supervisor
            .unwrap_or_else(|| Arc::new(ExecSupervisor));
        let reporter: Arc<dyn HealthReporter> = self.reporter.unwrap_or_else(|| {
            Arc::new(HeartbeatReporter::new(self.config.monitor.dashboard_url.clone()))
        });

        let config = Arc::new(self.config);
        let scheduler = Arc::new(UpdateScheduler::new(
            Arc::clone(&config),
            source,
            supervisor,
            invocation,
            events_tx.clone(),
        ));

        Ok(RunningAgent {
            config,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
            reporter,
            scheduler,
        })
    }
}

/// An assembled agent.
pub struct RunningAgent {
    config: Arc<AgentConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: AgentEventsSender,
    events_rx: Option<AgentEventsChannel>,
    reporter: Arc<dyn HealthReporter>,
    scheduler: Arc<UpdateScheduler>,
}

impl RunningAgent {
    /// Root of the live installation.
    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.config.install_dir
    }

    /// Get a receiver for agent events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<AgentEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to agent events.
    #[must_use]
    pub fn subscribe_events(&self) -> AgentEventsChannel {
        self.events_tx.subscribe()
    }

    /// The update scheduler, for on-demand checks.
    #[must_use]
    pub fn scheduler(&self) -> Arc<UpdateScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Run the monitoring loop and, when enabled, the update loop until
    /// shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent encounters a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting os-health-agent");
        let _ = self.events_tx.send(AgentEvent::Started);

        let monitor = tokio::spawn(run_monitor_loop(
            Arc::clone(&self.reporter),
            Duration::from_secs(self.config.monitor.report_interval_secs),
            self.events_tx.clone(),
            self.shutdown_rx.clone(),
        ));

        let updater = if self.config.upgrade.enabled {
            Some(tokio::spawn(
                Arc::clone(&self.scheduler).run(self.shutdown_rx.clone()),
            ))
        } else {
            info!("Self-update disabled");
            None
        };

        info!("Agent running, waiting for shutdown signal");
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        let _ = self.events_tx.send(AgentEvent::ShuttingDown);
        if let Err(e) = monitor.await {
            warn!("Monitoring loop ended abnormally: {}", e);
        }
        if let Some(updater) = updater {
            if let Err(e) = updater.await {
                warn!("Update loop ended abnormally: {}", e);
            }
        }
        info!("Agent shutdown complete");
        Ok(())
    }

    /// Request the agent to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle that can request shutdown from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}
