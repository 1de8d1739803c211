//! Health monitor for managed apps
//!
//! Two phases, both probing `GET /_/heartbeat` on the app's port:
//! a bounded readiness wait right after a launch, then a background
//! heartbeat that flips a handle between `Live` and `Unresponsive`.
//! The monitor never restarts or removes a process.

use crate::config::Config;
use crate::pool::{ConnectionPool, ProbeResult};
use crate::registry::{AppRegistry, HEARTBEAT_PATH};
use crate::runtime::{AppState, RuntimeRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing knobs for probing
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// First delay between readiness probes
    pub poll_interval: Duration,
    /// Upper bound for the doubling readiness delay
    pub max_poll_interval: Duration,
    /// Give up waiting for readiness after this long
    pub startup_timeout: Duration,
    /// Delay between heartbeats once live
    pub heartbeat_interval: Duration,
    /// Bound on a single probe
    pub probe_timeout: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.defaults;
        Self {
            poll_interval: defaults.startup_poll_interval(),
            max_poll_interval: defaults.startup_max_poll_interval(),
            startup_timeout: defaults.startup_timeout(),
            heartbeat_interval: defaults.heartbeat_interval(),
            probe_timeout: defaults.probe_timeout(),
        }
    }
}

/// Outcome of waiting for a launch to become live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Heartbeat answered 200, handle is now `Live`
    Ready,
    /// No successful heartbeat within the startup timeout
    TimedOut,
    /// The awaited handle was replaced or removed, or the daemon is stopping
    Superseded,
}

pub struct HealthMonitor {
    apps: Arc<AppRegistry>,
    runtime: Arc<RuntimeRegistry>,
    pool: Arc<ConnectionPool>,
    settings: HealthSettings,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        apps: Arc<AppRegistry>,
        runtime: Arc<RuntimeRegistry>,
        pool: Arc<ConnectionPool>,
        settings: HealthSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            apps,
            runtime,
            pool,
            settings,
            shutdown_rx,
        }
    }

    /// Wait for whichever handle is currently published for `name`
    pub async fn wait_for_live(&self, name: &str) -> Readiness {
        match self.runtime.snapshot(name) {
            Some(snapshot) => self.wait_for_generation(name, snapshot.generation).await,
            None => {
                debug!(app = name, "Nothing published, nothing to wait for");
                Readiness::Superseded
            }
        }
    }

    /// Poll the heartbeat of launch `generation` until it answers 200.
    ///
    /// The delay starts at `poll_interval` and doubles up to
    /// `max_poll_interval`; the whole wait is bounded by `startup_timeout`.
    pub async fn wait_for_generation(&self, name: &str, generation: u64) -> Readiness {
        let Some(app) = self.apps.lookup_by_name(name) else {
            return Readiness::Superseded;
        };
        let port = app.listen_port;
        let timeout = self.settings.startup_timeout;
        let start = Instant::now();
        let mut interval = self.settings.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        debug!(app = name, port, generation, "Waiting for app to become live");

        loop {
            if !self.is_current(name, generation) {
                debug!(app = name, generation, "Handle replaced while waiting");
                return Readiness::Superseded;
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            let probe_timeout = self.settings.probe_timeout.min(remaining);
            let result = self.pool.probe(port, HEARTBEAT_PATH, probe_timeout).await;

            if result.is_healthy() {
                return self.mark_live(name, generation, start.elapsed());
            }
            debug!(app = name, ?result, "App not ready yet");

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                error!(
                    app = name,
                    generation,
                    timeout_secs = timeout.as_secs(),
                    "App did not become live before the startup timeout"
                );
                return Readiness::TimedOut;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.min(remaining)) => {}
                _ = shutdown_rx.changed() => {
                    debug!(app = name, "Shutdown while waiting for app");
                    return Readiness::Superseded;
                }
            }
            interval = (interval * 2).min(self.settings.max_poll_interval);
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.runtime
            .snapshot(name)
            .is_some_and(|s| s.generation == generation)
    }

    fn mark_live(&self, name: &str, generation: u64, waited: Duration) -> Readiness {
        let moved = self.runtime.transition(
            name,
            Some(generation),
            &[AppState::Starting, AppState::Unresponsive],
            AppState::Live,
        );
        let live = moved
            || self
                .runtime
                .snapshot(name)
                .is_some_and(|s| s.generation == generation && s.state == AppState::Live);

        if live {
            info!(app = name, generation, waited_ms = waited.as_millis() as u64, "App is live");
            Readiness::Ready
        } else {
            Readiness::Superseded
        }
    }

    /// Heartbeat `name` every `heartbeat_interval` until shutdown.
    ///
    /// Follows whichever handle is published, so one task per app survives
    /// any number of redeploys.
    pub fn spawn_heartbeat(self: &Arc<Self>, name: &str) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let name = name.to_string();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            debug!(
                app = %name,
                interval_ms = monitor.settings.heartbeat_interval.as_millis() as u64,
                "Heartbeat started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(monitor.settings.heartbeat_interval) => {
                        monitor.heartbeat_once(&name).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(app = %name, "Heartbeat stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One heartbeat against the published handle. Returns `None` when there
    /// was nothing to probe.
    pub async fn heartbeat_once(&self, name: &str) -> Option<ProbeResult> {
        let snapshot = self.runtime.snapshot(name)?;
        if !matches!(snapshot.state, AppState::Live | AppState::Unresponsive) {
            return None;
        }
        let port = self.apps.lookup_by_name(name)?.listen_port;

        let result = self
            .pool
            .probe(port, HEARTBEAT_PATH, self.settings.probe_timeout)
            .await;

        if result.is_healthy() {
            if self.runtime.transition(
                name,
                Some(snapshot.generation),
                &[AppState::Unresponsive],
                AppState::Live,
            ) {
                info!(app = name, pid = snapshot.pid, "App answering heartbeats again");
            }
        } else if self.runtime.transition(
            name,
            Some(snapshot.generation),
            &[AppState::Live],
            AppState::Unresponsive,
        ) {
            warn!(app = name, pid = snapshot.pid, ?result, "Heartbeat failed, app unresponsive");
        }

        Some(result)
    }
}
