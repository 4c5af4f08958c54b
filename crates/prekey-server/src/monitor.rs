//! One-time prekey depletion monitor.
//!
//! Periodically walks every user that has uploaded OPKs and flags those whose
//! unused supply has dropped below a threshold. The monitor only observes: it
//! never generates or uploads keys, since OPK private halves live on the
//! owner's device.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──run()──► Running ──shutdown──► Stopped
//! ```
//!
//! Shutdown is cooperative. It is observed while waiting for the next tick
//! and between per-user checks, so a stop request waits for at most one
//! in-flight count.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::storage::KeyStore;

/// Default low-supply threshold
pub const DEFAULT_THRESHOLD: usize = 10;

/// Default time between scans
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// `tokio::time::interval` rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Users with strictly fewer unused OPKs than this are flagged
    pub threshold: usize,
    /// Time between scans
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD, interval: DEFAULT_INTERVAL }
    }
}

/// Receives low-supply alerts.
pub trait AlertSink: Send + Sync {
    /// `user_id` has `available` unused OPKs, below `threshold`.
    fn low_opks(&self, user_id: &str, available: usize, threshold: usize);
}

/// Logs alerts at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn low_opks(&self, user_id: &str, available: usize, threshold: usize) {
        tracing::warn!(user_id, available, threshold, "user is low on one-time prekeys");
    }
}

/// Monitor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed, not yet running
    Created,
    /// Scan loop active
    Running,
    /// Scan loop exited
    Stopped,
}

/// A user flagged during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowUser {
    /// Flagged user
    pub user_id: String,
    /// Unused OPKs at the time of the check
    pub available: usize,
}

/// Outcome of one scan over all users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Users whose count was read
    pub checked: usize,
    /// Users below the threshold, in scan order
    pub low: Vec<LowUser>,
    /// Users whose count could not be read
    pub failed: usize,
    /// Scan stopped early because shutdown was requested
    pub cancelled: bool,
}

/// Monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    /// `run` was called on a monitor that had already been started
    #[error("OPK monitor already started")]
    AlreadyStarted,

    /// The spawned monitor task panicked or was aborted
    #[error("OPK monitor task failed: {0}")]
    Task(String),
}

/// Background watcher for OPK depletion.
pub struct OpkMonitor<S: KeyStore> {
    store: S,
    config: MonitorConfig,
    alerts: Arc<dyn AlertSink>,
    state: Arc<watch::Sender<MonitorState>>,
}

impl<S: KeyStore> OpkMonitor<S> {
    /// Monitor over `store` reporting to [`TracingAlertSink`].
    pub fn new(store: S, config: MonitorConfig) -> Self {
        let (state, _) = watch::channel(MonitorState::Created);
        Self { store, config, alerts: Arc::new(TracingAlertSink), state: Arc::new(state) }
    }

    /// Report alerts to `alerts` instead.
    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Scan every user with OPKs once.
    ///
    /// Failures are logged and skipped: a failed listing yields an empty
    /// report, a failed count marks that user failed and moves on. Stops
    /// early, with `cancelled` set, once `shutdown` reads `true`.
    pub fn check_all_users(&self, shutdown: &watch::Receiver<bool>) -> TickReport {
        let mut report = TickReport::default();

        let users = match self.store.list_users_with_opks() {
            Ok(users) => users,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list users with one-time prekeys");
                return report;
            },
        };

        for user_id in users {
            if *shutdown.borrow() {
                report.cancelled = true;
                break;
            }

            match self.store.count_available_opks(&user_id) {
                Ok(available) => {
                    report.checked += 1;
                    if available < self.config.threshold {
                        self.alerts.low_opks(&user_id, available, self.config.threshold);
                        report.low.push(LowUser { user_id, available });
                    }
                },
                Err(err) => {
                    tracing::warn!(user_id, error = %err, "failed to count one-time prekeys");
                    report.failed += 1;
                },
            }
        }

        tracing::debug!(
            checked = report.checked,
            low = report.low.len(),
            failed = report.failed,
            cancelled = report.cancelled,
            "OPK scan complete"
        );

        report
    }

    /// Run the scan loop until `shutdown` becomes `true` or its sender is
    /// dropped.
    ///
    /// The first scan starts immediately. A scan that overruns the interval
    /// delays the next one rather than triggering a burst.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` if this monitor has been run before.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == MonitorState::Created {
                *state = MonitorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(MonitorError::AlreadyStarted);
        }

        let period = self.config.interval.max(MIN_INTERVAL);
        tracing::info!(
            threshold = self.config.threshold,
            interval_ms = period.as_millis() as u64,
            "OPK monitor started"
        );

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            if self.check_all_users(&shutdown).cancelled {
                break;
            }
        }

        self.state.send_replace(MonitorState::Stopped);
        tracing::info!("OPK monitor stopped");

        Ok(())
    }

    /// Run the monitor on a background task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });

        MonitorHandle { shutdown, state, task }
    }
}

/// Control handle for a spawned [`OpkMonitor`].
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<MonitorState>,
    task: JoinHandle<Result<(), MonitorError>>,
}

impl MonitorHandle {
    /// Current lifecycle state of the monitor.
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Request shutdown and wait for the loop to exit.
    pub async fn stop(self) -> Result<(), MonitorError> {
        self.shutdown.send_replace(true);
        self.task.await.map_err(|err| MonitorError::Task(err.to_string()))?
    }
}
