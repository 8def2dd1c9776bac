//! Runtime settings shared by the launcher and the detached process tree.

use std::path::PathBuf;
use std::time::Duration;

/// Directory name created under the user's home for status files.
pub const JOB_DIR_NAME: &str = ".async_jobs";

/// Default interval between watchdog polls.
pub const DEFAULT_POLL_STEP: Duration = Duration::from_secs(5);

/// How long the launcher lingers after answering, so the worker can read its
/// transient inputs before the caller removes them.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Pause after the group kill before the watchdog reaps and exits.
pub const DEFAULT_KILL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub job_dir: PathBuf,
    pub poll_step: Duration,
    pub startup_grace: Duration,
    pub kill_settle: Duration,
    /// Append diagnostics here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            job_dir: default_job_dir(),
            poll_step: DEFAULT_POLL_STEP,
            startup_grace: DEFAULT_STARTUP_GRACE,
            kill_settle: DEFAULT_KILL_SETTLE,
            log_file: None,
        }
    }
}

impl Settings {
    pub fn with_job_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_dir = dir.into();
        self
    }

    pub fn with_poll_step(mut self, step: Duration) -> Self {
        self.poll_step = step;
        self
    }

    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }
}

/// `$HOME/.async_jobs`, or the same name under the temp dir when HOME is unset.
pub fn default_job_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(JOB_DIR_NAME),
        _ => std::env::temp_dir().join(JOB_DIR_NAME),
    }
}
