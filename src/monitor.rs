//! Health reporting loop.
//!
//! Metric collection and transport live behind [`HealthReporter`]; this
//! module only drives it on a fixed interval, independently of updates.

use crate::error::Result;
use crate::event::{AgentEvent, AgentEventsSender};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Produces and delivers one health report.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Collect metrics and send report number `sequence`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the loop, which keeps running.
    async fn collect_and_send(&self, sequence: u64) -> Result<()>;
}

/// Reporter that only logs a heartbeat.
///
/// ```
/// use os_health_agent::monitor::{HealthReporter, HeartbeatReporter};
///
/// # tokio_test::block_on(async {
/// let reporter = HeartbeatReporter::new(None);
/// assert!(reporter.collect_and_send(1).await.is_ok());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReporter {
    dashboard_url: Option<String>,
}

impl HeartbeatReporter {
    /// Heartbeat reporter for an optional dashboard.
    #[must_use]
    pub fn new(dashboard_url: Option<String>) -> Self {
        Self { dashboard_url }
    }
}

#[async_trait]
impl HealthReporter for HeartbeatReporter {
    async fn collect_and_send(&self, sequence: u64) -> Result<()> {
        match &self.dashboard_url {
            Some(url) => info!("Heartbeat #{} (dashboard: {})", sequence, url),
            None => info!("Heartbeat #{}", sequence),
        }
        Ok(())
    }
}

/// Call `reporter` every `period` until `shutdown` flips to true.
pub async fn run_monitor_loop(
    reporter: Arc<dyn HealthReporter>,
    period: Duration,
    events: AgentEventsSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;
    debug!("Monitoring loop started, reporting every {:?}", period);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                sequence += 1;
                match reporter.collect_and_send(sequence).await {
                    Ok(()) => {
                        let _ = events.send(AgentEvent::ReportProduced { sequence });
                    }
                    Err(e) => {
                        warn!("Health report #{} failed: {}", sequence, e);
                        let _ = events.send(AgentEvent::Error {
                            message: format!("health report failed: {e}"),
                        });
                    }
                }
            }
        }
    }

    debug!("Monitoring loop stopped after {} reports", sequence);
}
