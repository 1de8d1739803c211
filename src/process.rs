use crate::config::Config;
use crate::error::StepError;
use crate::logs::StepLogs;
use crate::registry::{AppRegistry, AppSpec};
use crate::runtime::{AppState, ProcessHandle, RuntimeRegistry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Marker whose presence means the working copy is already cloned
const VCS_MARKER: &str = ".git";

/// Filesystem and tooling settings for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Base directory; each app is cloned into `<directory>/<name>`
    pub directory: PathBuf,
    /// git executable
    pub git: String,
    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_grace_period: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            directory: config.server.directory.clone(),
            git: config.server.git.clone(),
            shutdown_grace_period: config.defaults.shutdown_grace_period(),
        }
    }
}

/// Owns the subprocess lifecycle of every managed app.
///
/// # Serialization
///
/// Each app has its own async mutex. Every public operation holds it for its
/// whole duration, so a restart's kill, rebuild and publish for one app
/// cannot interleave with another operation on the same app, while apps
/// proceed independently of each other.
///
/// Provisioning steps (clone, checkout, pull, build) are best effort: a
/// failure is logged and the sequence continues with whatever is on disk.
pub struct Supervisor {
    apps: Arc<AppRegistry>,
    runtime: Arc<RuntimeRegistry>,
    settings: SupervisorSettings,
    logs: StepLogs,
    /// Per-app serialization, fixed at construction
    locks: HashMap<String, Mutex<()>>,
}

impl Supervisor {
    /// Create a supervisor for every app in `apps`.
    ///
    /// Returns `Arc<Self>` because it is shared by the deployer, the health
    /// monitor and the shutdown path.
    pub fn new(
        apps: Arc<AppRegistry>,
        runtime: Arc<RuntimeRegistry>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        let locks = apps.names().map(|n| (n.to_string(), Mutex::new(()))).collect();
        let logs = StepLogs::new(&settings.directory);
        Arc::new(Self {
            apps,
            runtime,
            settings,
            logs,
            locks,
        })
    }

    pub fn apps(&self) -> &Arc<AppRegistry> {
        &self.apps
    }

    pub fn runtime(&self) -> &Arc<RuntimeRegistry> {
        &self.runtime
    }

    /// Working copy of an app
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.settings.directory.join(name)
    }

    fn spec(&self, name: &str) -> Result<&AppSpec, StepError> {
        self.apps
            .lookup_by_name(name)
            .ok_or_else(|| StepError::UnknownApp(name.to_string()))
    }

    async fn lock(&self, name: &str) -> Result<MutexGuard<'_, ()>, StepError> {
        let lock = self
            .locks
            .get(name)
            .ok_or_else(|| StepError::UnknownApp(name.to_string()))?;
        Ok(lock.lock().await)
    }

    /// Clone the repository unless the working copy already exists
    pub async fn ensure_cloned(&self, name: &str) -> Result<(), StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        self.ensure_cloned_locked(app).await
    }

    pub async fn checkout(&self, name: &str) -> Result<(), StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        self.checkout_locked(app).await
    }

    pub async fn pull(&self, name: &str) -> Result<(), StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        self.pull_locked(app).await
    }

    pub async fn build(&self, name: &str) -> Result<(), StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        self.build_locked(app).await
    }

    /// Start the entry command and publish its handle.
    ///
    /// Returns the launch generation of the new handle.
    pub async fn launch(&self, name: &str) -> Result<u64, StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        self.launch_locked(app).await
    }

    /// Terminate the app's process, if any. Returns whether one was published.
    pub async fn kill(&self, name: &str) -> Result<bool, StepError> {
        self.spec(name)?;
        let _guard = self.lock(name).await?;
        Ok(self.kill_locked(name).await)
    }

    /// Startup sequence: clone, checkout, pull, build, launch
    pub async fn provision(&self, name: &str) -> Result<u64, StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        info!(app = name, "Provisioning app");

        if let Err(e) = self.ensure_cloned_locked(app).await {
            warn!(app = name, error = %e, "Clone failed, continuing");
        }
        self.refresh_and_build_locked(app).await;
        self.launch_locked(app).await
    }

    /// Redeploy sequence: kill, checkout, pull, build, launch
    pub async fn restart(&self, name: &str) -> Result<u64, StepError> {
        let app = self.spec(name)?;
        let _guard = self.lock(name).await?;
        info!(app = name, "Restarting app");

        self.runtime.set_phase(name, AppState::Restarting);
        self.kill_locked(name).await;
        self.refresh_and_build_locked(app).await;
        self.launch_locked(app).await
    }

    /// Kill the handle of `generation` (if still current) and mark the app failed
    pub async fn fail(&self, name: &str, generation: u64) -> bool {
        let Ok(_guard) = self.lock(name).await else {
            return false;
        };
        match self.runtime.take_generation(name, generation) {
            Some(handle) => {
                self.terminate(handle).await;
                self.runtime.set_phase(name, AppState::Failed);
                true
            }
            None => {
                debug!(app = name, generation, "Handle already replaced, not marking failed");
                false
            }
        }
    }

    /// Kill every published process.
    ///
    /// Skips the per-app locks: a build running during shutdown must not hold
    /// the daemon open.
    pub async fn stop_all(&self) {
        let names = self.runtime.published_names();
        let stops = names.iter().filter_map(|name| self.runtime.take(name)).map(|handle| self.terminate(handle));
        futures::future::join_all(stops).await;
    }

    async fn refresh_and_build_locked(&self, app: &AppSpec) {
        if let Err(e) = self.checkout_locked(app).await {
            warn!(app = %app.name, error = %e, "Checkout failed, continuing");
        }
        if let Err(e) = self.pull_locked(app).await {
            warn!(app = %app.name, error = %e, "Pull failed, continuing");
        }
        if let Err(e) = self.build_locked(app).await {
            warn!(app = %app.name, error = %e, "Build failed, continuing");
        }
    }

    async fn ensure_cloned_locked(&self, app: &AppSpec) -> Result<(), StepError> {
        let dir = self.work_dir(&app.name);
        if dir.join(VCS_MARKER).exists() {
            debug!(app = %app.name, dir = %dir.display(), "Working copy present, skipping clone");
            return Ok(());
        }

        self.set_provisioning_phase(&app.name, AppState::Cloning);
        info!(app = %app.name, repo = %app.repository_url, dir = %dir.display(), "No git repo detected, cloning");

        tokio::fs::create_dir_all(&self.settings.directory)
            .await
            .map_err(|source| StepError::Io { step: "git clone", source })?;

        let argv = vec![
            self.settings.git.clone(),
            "clone".to_string(),
            app.repository_url.clone(),
            dir.to_string_lossy().into_owned(),
        ];
        self.run_step(app, "git clone", &argv, None).await
    }

    async fn checkout_locked(&self, app: &AppSpec) -> Result<(), StepError> {
        self.set_provisioning_phase(&app.name, AppState::Cloning);
        let argv = vec![
            self.settings.git.clone(),
            "checkout".to_string(),
            app.branch.clone(),
        ];
        self.run_step(app, "git checkout", &argv, Some(&self.work_dir(&app.name)))
            .await
    }

    async fn pull_locked(&self, app: &AppSpec) -> Result<(), StepError> {
        self.set_provisioning_phase(&app.name, AppState::Cloning);
        let argv = vec![self.settings.git.clone(), "pull".to_string()];
        self.run_step(app, "git pull", &argv, Some(&self.work_dir(&app.name)))
            .await
    }

    async fn build_locked(&self, app: &AppSpec) -> Result<(), StepError> {
        if app.build_command.is_empty() {
            debug!(app = %app.name, "No build command configured");
            return Ok(());
        }
        self.set_provisioning_phase(&app.name, AppState::Building);
        self.run_step(app, "build", &app.build_command, Some(&self.work_dir(&app.name)))
            .await
    }

    /// Restarts keep showing `Restarting` until the new handle is published
    fn set_provisioning_phase(&self, name: &str, state: AppState) {
        if self.runtime.state(name) != AppState::Restarting {
            self.runtime.set_phase(name, state);
        }
    }

    async fn launch_locked(&self, app: &AppSpec) -> Result<u64, StepError> {
        // The port can only be bound once: the old process goes first.
        self.kill_locked(&app.name).await;

        let Some((program, args)) = app.entry_command.split_first() else {
            self.runtime.set_phase(&app.name, AppState::Failed);
            return Err(StepError::EmptyCommand { step: "entry" });
        };
        let (stdout, stderr, log_path) = self.logs.open(&app.name, "entry");

        info!(
            app = %app.name,
            command = %app.entry_command.join(" "),
            port = app.listen_port,
            log = ?log_path,
            "Starting app from entry"
        );

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(self.work_dir(&app.name));
        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.kill_on_drop(true);
        // Own process group, so a kill reaches whatever the entry forks
        #[cfg(unix)]
        cmd.process_group(0);
        // App-specific entries are applied last so they win over PORT and the
        // inherited environment.
        cmd.env("PORT", app.listen_port.to_string());
        cmd.envs(&app.environment);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(app = %app.name, program = %program, error = %source, "Failed to launch app");
                self.runtime.set_phase(&app.name, AppState::Failed);
                return Err(StepError::Spawn {
                    step: "entry",
                    program: program.clone(),
                    source,
                });
            }
        };

        let generation = self.runtime.next_generation();
        let handle = ProcessHandle::new(&app.name, child, generation);
        info!(app = %app.name, pid = handle.pid(), generation, "App process spawned");

        if let Some(stale) = self.runtime.publish(handle) {
            warn!(app = %app.name, pid = stale.pid(), "Replacing unexpected live handle");
            self.terminate(stale).await;
        }

        Ok(generation)
    }

    async fn kill_locked(&self, name: &str) -> bool {
        match self.runtime.take(name) {
            Some(handle) => {
                self.terminate(handle).await;
                true
            }
            None => false,
        }
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn terminate(&self, handle: ProcessHandle) {
        let app = handle.app().to_string();
        let pid = handle.pid();
        let mut child = handle.into_child();
        stop_child(&app, pid, &mut child, self.settings.shutdown_grace_period).await;
    }

    async fn run_step(
        &self,
        app: &AppSpec,
        step: &'static str,
        argv: &[String],
        cwd: Option<&Path>,
    ) -> Result<(), StepError> {
        let (program, args) = argv.split_first().ok_or(StepError::EmptyCommand { step })?;
        let (stdout, stderr, log_path) = self.logs.open(&app.name, step);

        info!(app = %app.name, step, command = %argv.join(" "), log = ?log_path, "Running step");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let status = cmd.status().await.map_err(|source| StepError::Spawn {
            step,
            program: program.clone(),
            source,
        })?;

        if !status.success() {
            return Err(StepError::ExitStatus {
                step,
                program: program.clone(),
                status,
            });
        }

        debug!(app = %app.name, step, "Step finished");
        Ok(())
    }
}

/// Stop a child process, tolerating one that already exited
async fn stop_child(app: &str, pid: u32, child: &mut Child, grace_period: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        info!(app, pid, ?status, "App process had already exited");
        return;
    }

    info!(app, pid, "Killing app process");

    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(app, pid, ?status, "App process exited");
        }
        Ok(Err(e)) => {
            warn!(app, pid, error = %e, "Error waiting for app process to exit");
        }
        Err(_) => {
            warn!(
                app,
                pid,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
            if let Err(e) = child.kill().await {
                warn!(app, pid, error = %e, "Failed to kill app process");
            }
        }
    }
}

/// Signal the process group led by `pid`. ESRCH just means it is already gone.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}
