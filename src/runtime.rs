//! Runtime registry: which OS process currently serves each app
//!
//! Mutated only by the [`Supervisor`](crate::process::Supervisor) (publish /
//! take) and the health monitor (state transitions). Everybody else reads
//! [`HandleSnapshot`] copies, so a reader never observes a half-replaced entry.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Child;

/// Lifecycle state of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Nothing has happened yet
    Absent,
    /// Fetching sources (clone / checkout / pull)
    Cloning,
    /// Running the build command
    Building,
    /// Process launched, waiting for the first successful heartbeat
    Starting,
    /// Heartbeat answers 200
    Live,
    /// Was live, latest heartbeat failed
    Unresponsive,
    /// Redeploy in progress
    Restarting,
    /// Launch failed or never became live
    Failed,
}

/// Runtime record of a launched application process
#[derive(Debug)]
pub struct ProcessHandle {
    app: String,
    pid: u32,
    state: AppState,
    generation: u64,
    started_at: Instant,
    child: Child,
}

impl ProcessHandle {
    pub fn new(app: &str, child: Child, generation: u64) -> Self {
        Self {
            app: app.to_string(),
            pid: child.id().unwrap_or(0),
            state: AppState::Starting,
            generation,
            started_at: Instant::now(),
            child,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            app: self.app.clone(),
            pid: self.pid,
            state: self.state,
            generation: self.generation,
            uptime: self.started_at.elapsed(),
        }
    }

    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Point-in-time copy of a [`ProcessHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub app: String,
    pub pid: u32,
    pub state: AppState,
    pub generation: u64,
    pub uptime: Duration,
}

/// Guarded map from app name to its current process
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    handles: DashMap<String, ProcessHandle>,
    /// Supervisor activity overlay; wins over the handle state while present
    phases: DashMap<String, AppState>,
    next_generation: AtomicU64,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a launch generation, unique for the life of the daemon
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a freshly launched handle, returning whatever it replaced.
    ///
    /// Clears the supervisor phase so the handle state becomes visible.
    pub fn publish(&self, handle: ProcessHandle) -> Option<ProcessHandle> {
        let name = handle.app.clone();
        let previous = self.handles.insert(name.clone(), handle);
        self.phases.remove(&name);
        previous
    }

    /// Remove and return the handle for `name`
    pub fn take(&self, name: &str) -> Option<ProcessHandle> {
        self.handles.remove(name).map(|(_, h)| h)
    }

    /// Remove the handle only if it still belongs to `generation`
    pub fn take_generation(&self, name: &str, generation: u64) -> Option<ProcessHandle> {
        self.handles
            .remove_if(name, |_, h| h.generation == generation)
            .map(|(_, h)| h)
    }

    pub fn snapshot(&self, name: &str) -> Option<HandleSnapshot> {
        self.handles.get(name).map(|h| h.snapshot())
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    /// Effective state: supervisor phase, else handle state, else `Absent`
    pub fn state(&self, name: &str) -> AppState {
        if let Some(phase) = self.phases.get(name) {
            return *phase;
        }
        self.handles
            .get(name)
            .map(|h| h.state)
            .unwrap_or(AppState::Absent)
    }

    pub fn set_phase(&self, name: &str, state: AppState) {
        self.phases.insert(name.to_string(), state);
    }

    pub fn clear_phase(&self, name: &str) {
        self.phases.remove(name);
    }

    /// Move the handle from one of `from` to `to`.
    ///
    /// With `generation` set, only the handle of that launch is touched.
    /// Returns whether the transition happened.
    pub fn transition(
        &self,
        name: &str,
        generation: Option<u64>,
        from: &[AppState],
        to: AppState,
    ) -> bool {
        let Some(mut handle) = self.handles.get_mut(name) else {
            return false;
        };
        if generation.is_some_and(|g| g != handle.generation) {
            return false;
        }
        if !from.contains(&handle.state) {
            return false;
        }
        handle.state = to;
        true
    }

    /// Snapshots of every published handle, sorted by app name
    pub fn list(&self) -> Vec<HandleSnapshot> {
        let mut all: Vec<HandleSnapshot> = self.handles.iter().map(|h| h.snapshot()).collect();
        all.sort_by(|a, b| a.app.cmp(&b.app));
        all
    }

    pub fn published_names(&self) -> Vec<String> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sleep() -> Child {
        Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_replaces_and_returns_previous() {
        let registry = RuntimeRegistry::new();
        let first = ProcessHandle::new("api", spawn_sleep(), registry.next_generation());
        let first_pid = first.pid();

        assert!(registry.publish(first).is_none());
        let second = ProcessHandle::new("api", spawn_sleep(), registry.next_generation());
        let replaced = registry.publish(second).unwrap();

        assert_eq!(replaced.pid(), first_pid);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.snapshot("api").unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_phase_overlays_handle_state() {
        let registry = RuntimeRegistry::new();
        assert_eq!(registry.state("api"), AppState::Absent);

        registry.set_phase("api", AppState::Building);
        assert_eq!(registry.state("api"), AppState::Building);

        let handle = ProcessHandle::new("api", spawn_sleep(), registry.next_generation());
        registry.publish(handle);
        assert_eq!(registry.state("api"), AppState::Starting);

        registry.set_phase("api", AppState::Restarting);
        assert_eq!(registry.state("api"), AppState::Restarting);
        registry.clear_phase("api");
        assert_eq!(registry.state("api"), AppState::Starting);
    }

    #[tokio::test]
    async fn test_transition_respects_generation_and_source_state() {
        let registry = RuntimeRegistry::new();
        let generation = registry.next_generation();
        registry.publish(ProcessHandle::new("api", spawn_sleep(), generation));

        assert!(!registry.transition("api", Some(generation + 1), &[AppState::Starting], AppState::Live));
        assert!(!registry.transition("api", Some(generation), &[AppState::Live], AppState::Unresponsive));
        assert!(registry.transition("api", Some(generation), &[AppState::Starting], AppState::Live));
        assert_eq!(registry.state("api"), AppState::Live);
        assert!(registry.transition("api", None, &[AppState::Live], AppState::Unresponsive));
        assert_eq!(registry.state("api"), AppState::Unresponsive);
        assert!(!registry.transition("missing", None, &[AppState::Live], AppState::Live));
    }

    #[tokio::test]
    async fn test_take_generation_ignores_newer_handle() {
        let registry = RuntimeRegistry::new();
        let old = registry.next_generation();
        let new = registry.next_generation();
        registry.publish(ProcessHandle::new("api", spawn_sleep(), new));

        assert!(registry.take_generation("api", old).is_none());
        assert!(registry.is_published("api"));
        assert!(registry.take_generation("api", new).is_some());
        assert!(!registry.is_published("api"));
        assert!(registry.take("api").is_none());
    }
}
