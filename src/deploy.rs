//! Deployment orchestration
//!
//! Ties the supervisor and the health monitor together: the initial deploy
//! of every app at startup, and redeploys requested by the dispatcher.

use crate::dispatcher::{RedeployTarget, ScheduleOutcome};
use crate::health::{HealthMonitor, Readiness};
use crate::process::Supervisor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Single-flight state of one app.
///
/// `run` is held for the whole of a deploy. `pending` is set while a
/// scheduled redeploy has not yet acquired `run`; requests arriving then
/// fold into it.
#[derive(Default)]
struct RedeploySlot {
    run: tokio::sync::Mutex<()>,
    pending: AtomicBool,
}

#[derive(Clone)]
pub struct Deployer {
    supervisor: Arc<Supervisor>,
    monitor: Arc<HealthMonitor>,
    slots: Arc<HashMap<String, Arc<RedeploySlot>>>,
    /// Background deploy and heartbeat tasks, aborted on shutdown
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Deployer {
    pub fn new(supervisor: Arc<Supervisor>, monitor: Arc<HealthMonitor>) -> Self {
        let slots = supervisor
            .apps()
            .names()
            .map(|name| (name.to_string(), Arc::new(RedeploySlot::default())))
            .collect();
        Self {
            supervisor,
            monitor,
            slots: Arc::new(slots),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start the initial deploy of every app as its own task
    pub fn spawn_initial_deploys(&self) {
        let names: Vec<String> = self.supervisor.apps().names().map(String::from).collect();
        info!(count = names.len(), "Starting initial deploys");
        for name in names {
            let deployer = self.clone();
            self.track(tokio::spawn(async move {
                deployer.initial_deploy(&name).await;
            }));
        }
    }

    /// Provision, wait for readiness, then keep a heartbeat running.
    ///
    /// The heartbeat is started even when the launch failed so that a later
    /// redeploy is monitored too.
    pub async fn initial_deploy(&self, name: &str) -> Option<Readiness> {
        let slot = self.slots.get(name)?.clone();
        let readiness = {
            let _run = slot.run.lock().await;
            match self.supervisor.provision(name).await {
                Ok(generation) => Some(self.await_readiness(name, generation).await),
                Err(e) => {
                    error!(app = name, error = %e, "Initial deploy failed");
                    None
                }
            }
        };
        self.track(self.monitor.spawn_heartbeat(name));
        readiness
    }

    /// Restart from the newest commit and wait for readiness
    pub async fn redeploy(&self, name: &str) -> Option<Readiness> {
        info!(app = name, "Redeploying");
        match self.supervisor.restart(name).await {
            Ok(generation) => Some(self.await_readiness(name, generation).await),
            Err(e) => {
                error!(app = name, error = %e, "Redeploy failed");
                None
            }
        }
    }

    async fn await_readiness(&self, name: &str, generation: u64) -> Readiness {
        let readiness = self.monitor.wait_for_generation(name, generation).await;
        match readiness {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                if self.supervisor.fail(name, generation).await {
                    error!(app = name, generation, "App never became live, stopped and marked failed");
                }
            }
            Readiness::Superseded => {
                debug!(app = name, generation, "Launch superseded before becoming live");
            }
        }
        readiness
    }

    /// Queue a redeploy unless one is already waiting to start
    pub fn schedule_redeploy(&self, name: &str) -> ScheduleOutcome {
        let Some(slot) = self.slots.get(name).cloned() else {
            warn!(app = name, "Redeploy requested for unknown app");
            return ScheduleOutcome::UnknownApp;
        };

        if slot.pending.swap(true, Ordering::SeqCst) {
            debug!(app = name, "Redeploy already queued, coalescing");
            return ScheduleOutcome::Coalesced;
        }

        let deployer = self.clone();
        let name = name.to_string();
        self.track(tokio::spawn(async move {
            let _run = slot.run.lock().await;
            // From here on a new request queues a fresh run, which will see
            // any commit pushed after this one pulled.
            slot.pending.store(false, Ordering::SeqCst);
            deployer.redeploy(&name).await;
        }));
        ScheduleOutcome::Scheduled
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Abort outstanding deploy and heartbeat tasks and wait for them to
    /// unwind, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        debug!(count = tasks.len(), "Aborting deploy tasks");
        for task in &tasks {
            task.abort();
        }
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Timed out waiting for deploy tasks to stop");
        }
    }
}

impl RedeployTarget for Deployer {
    fn schedule_redeploy(&self, name: &str) -> ScheduleOutcome {
        Deployer::schedule_redeploy(self, name)
    }
}
