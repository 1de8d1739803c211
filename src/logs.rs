//! Per-invocation log files for supervised subprocesses
//!
//! Every clone/checkout/pull/build/entry invocation writes its stdout and
//! stderr to `<directory>/.log/<app>.<command>.<timestamp>.log`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::warn;

/// Name of the log directory inside the base directory
pub const LOG_DIR_NAME: &str = ".log";

/// Where subprocess output is written
#[derive(Debug, Clone)]
pub struct StepLogs {
    dir: PathBuf,
}

impl StepLogs {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join(LOG_DIR_NAME),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for one invocation of `command` on behalf of `app`
    pub fn path_for(&self, app: &str, command: &str) -> PathBuf {
        let command = command.split_whitespace().collect::<Vec<_>>().join("-");
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f");
        self.dir.join(format!("{}.{}.{}.log", app, command, stamp))
    }

    /// Open stdout/stderr handles for one invocation.
    ///
    /// Falls back to the daemon's stderr when the file cannot be created, so
    /// a full disk never stops a deploy.
    pub fn open(&self, app: &str, command: &str) -> (Stdio, Stdio, Option<PathBuf>) {
        let path = self.path_for(app, command);
        match open_log_file(&path) {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err), Some(path)),
            Err(e) => {
                warn!(app, command, path = %path.display(), error = %e, "Couldn't open log file, piping to stderr");
                (Stdio::inherit(), Stdio::inherit(), None)
            }
        }
    }
}

fn open_log_file(path: &Path) -> std::io::Result<(File, File)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let err = file.try_clone()?;
    Ok((file, err))
}

/// Create the base directory and its log directory.
///
/// A regular file occupying either path is a configuration error.
pub fn prepare_directories(base_dir: &Path) -> anyhow::Result<()> {
    for dir in [base_dir.to_path_buf(), base_dir.join(LOG_DIR_NAME)] {
        if dir.exists() && !dir.is_dir() {
            anyhow::bail!("'{}' exists and is not a directory", dir.display());
        }
        std::fs::create_dir_all(&dir).map_err(|e| {
            anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e)
        })?;
    }
    Ok(())
}
