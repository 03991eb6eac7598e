//! Heartbeat sweep marking silent sessions inactive.
//!
//! Each sweep also releases the in-memory state of ended sessions: their
//! slots and the activity watermarks of their users.

use super::activity_store::ActivityEventStore;
use super::session_store::{SessionStateStore, SweepReport};
use crate::Result;
use crate::clock::Clock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Heartbeat configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Silence after which a session becomes inactive, in seconds.
    pub timeout_s: u64,
    /// Interval between sweeps, in seconds.
    pub sweep_interval_s: u64,
    /// Longest wait for one slot lock during a sweep, in milliseconds.
    pub lock_wait_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_s: 120,
            sweep_interval_s: 30,
            lock_wait_ms: 50,
        }
    }
}

/// Periodic heartbeat sweeper.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    sessions: Arc<SessionStateStore>,
    activity: Arc<ActivityEventStore>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStateStore>,
        activity: Arc<ActivityEventStore>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            sessions,
            activity,
            clock,
            config,
        }
    }

    /// Runs one sweep at the clock's current time.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let timeout =
            chrono::Duration::seconds(i64::try_from(self.config.timeout_s).unwrap_or(i64::MAX));
        let report = self
            .sessions
            .sweep(
                self.clock.now(),
                timeout,
                Duration::from_millis(self.config.lock_wait_ms),
            )
            .await?;

        if report.inactivated > 0 {
            metrics::counter!("heartbeat_sessions_inactivated_total")
                .increment(report.inactivated as u64);
        }
        if report.skipped > 0 {
            metrics::counter!("heartbeat_slots_skipped_total").increment(report.skipped as u64);
        }
        for key in &report.evicted {
            self.activity.forget_user(&key.user_id);
        }
        metrics::counter!("heartbeat_slots_evicted_total").increment(report.evicted.len() as u64);
        metrics::gauge!("heartbeat_resident_slots").set(self.sessions.len() as f64);
        tracing::debug!(
            examined = report.examined,
            inactivated = report.inactivated,
            skipped = report.skipped,
            evicted = report.evicted.len(),
            "Heartbeat sweep complete"
        );
        Ok(report)
    }

    /// Spawns the sweep loop; it stops when `shutdown` becomes `true` or its
    /// sender is dropped.
    #[must_use]
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.sweep_interval_s.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval_s = period.as_secs(),
                timeout_s = self.config.timeout_s,
                "Heartbeat monitor started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            tracing::warn!(error = %err, "Heartbeat sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Heartbeat monitor stopped");
        })
    }
}
