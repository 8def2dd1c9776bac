//! Foreground entry point.
//!
//! Validates the request, allocates the job id and status file, then starts
//! the watchdog in a new session with its stdio on `/dev/null`. The launcher
//! never waits on it: once the launcher exits the watchdog belongs to init.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::stat::{umask, Mode};
use nix::unistd::setsid;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::config::Settings;
use crate::diag::Diagnostics;
use crate::job::{ensure_job_dir, JobId, JobIdError};
use crate::status::{StatusFile, StatusRecord};
use crate::watchdog::WatchdogSpec;

/// Positional input from the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    pub token: String,
    pub time_limit: u64,
    pub module: String,
    pub args_file: Option<String>,
}

impl LaunchRequest {
    /// Module path followed by the arguments file, if any.
    pub fn command_line(&self) -> String {
        match &self.args_file {
            Some(args) => format!("{} {}", self.module, shell_words::quote(args)),
            None => self.module.clone(),
        }
    }
}

/// Failures reported to the caller before anything is started.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid correlation token: {0}")]
    Token(#[from] JobIdError),
    #[error("time limit must be a positive number of seconds")]
    TimeLimit,
    #[error("module path must not be empty")]
    EmptyModule,
    #[error("could not create: {}", .path.display())]
    JobDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write {}: {source}", .path.display())]
    StatusFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("FATAL ERROR: {0}")]
    Spawn(#[source] io::Error),
}

/// Printed on stdout once the background tree is on its way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchResponse {
    pub started: bool,
    pub job_id: String,
    pub results_file: PathBuf,
}

/// Printed on stdout when the job was never started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureResponse {
    pub failed: bool,
    pub msg: String,
}

impl FailureResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            failed: true,
            msg: msg.into(),
        }
    }
}

impl From<&SetupError> for FailureResponse {
    fn from(err: &SetupError) -> Self {
        Self::new(err.to_string())
    }
}

pub struct Launcher<'a> {
    program: PathBuf,
    settings: &'a Settings,
    diag: &'a Diagnostics,
}

impl<'a> Launcher<'a> {
    /// `program` is re-executed in the watchdog role.
    pub fn new(
        program: impl Into<PathBuf>,
        settings: &'a Settings,
        diag: &'a Diagnostics,
    ) -> Self {
        Self {
            program: program.into(),
            settings,
            diag,
        }
    }

    /// Validate, allocate the job and write its started record.
    pub fn prepare(&self, req: &LaunchRequest) -> Result<WatchdogSpec, SetupError> {
        if req.time_limit == 0 {
            return Err(SetupError::TimeLimit);
        }
        if req.module.trim().is_empty() {
            return Err(SetupError::EmptyModule);
        }
        let job_id = JobId::for_current_process(&req.token)?;

        let job_dir = &self.settings.job_dir;
        ensure_job_dir(job_dir).map_err(|source| SetupError::JobDir {
            path: job_dir.clone(),
            source,
        })?;

        let results_file = job_id.results_file(job_dir);
        StatusFile::new(&results_file)
            .write(&StatusRecord::started(&job_id))
            .map_err(|source| SetupError::StatusFile {
                path: results_file.clone(),
                source,
            })?;

        Ok(WatchdogSpec {
            job_id,
            results_file,
            time_limit: Duration::from_secs(req.time_limit),
            poll_step: self.settings.poll_step,
            command: req.command_line(),
            log_file: self.settings.log_file.clone(),
        })
    }

    /// Prepare the job and detach its watchdog. Returns without waiting.
    pub fn launch(&self, req: &LaunchRequest) -> Result<LaunchResponse, SetupError> {
        let _log = self.diag.enter();
        info!(token = %req.token, time_limit = req.time_limit, module = %req.module, "invoked");

        let spec = self.prepare(req)?;
        let _span = info_span!("launcher", job = %spec.job_id).entered();
        let pid = match spawn_detached(&self.program, spec.to_args()) {
            Ok(pid) => pid,
            Err(err) => {
                // Nothing will ever settle a started record without a watchdog.
                if let Err(rm) = fs::remove_file(&spec.results_file) {
                    warn!(error = %rm, "could not remove status file");
                }
                return Err(SetupError::Spawn(err));
            }
        };
        info!(watchdog_pid = pid, "task started");

        Ok(LaunchResponse {
            started: true,
            job_id: spec.job_id.to_string(),
            results_file: spec.results_file,
        })
    }
}

/// Start `program` in its own session, cwd `/`, umask 022, stdio on
/// `/dev/null`. The child handle is dropped without waiting.
pub fn spawn_detached<I, S>(program: &Path, args: I) -> io::Result<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: setsid and umask are async-signal-safe and touch no shared state.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            umask(Mode::from_bits_truncate(0o022));
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobState;
    use tempfile::tempdir;

    fn request(token: &str) -> LaunchRequest {
        LaunchRequest {
            token: token.to_string(),
            time_limit: 30,
            module: "/tmp/module".to_string(),
            args_file: Some("/tmp/args file".to_string()),
        }
    }

    #[test]
    fn command_line_appends_quoted_args_file() {
        let mut req = request("tok");
        assert_eq!(req.command_line(), "/tmp/module '/tmp/args file'");
        req.args_file = Some("/tmp/args".into());
        assert_eq!(req.command_line(), "/tmp/module /tmp/args");
        req.args_file = None;
        assert_eq!(req.command_line(), "/tmp/module");
    }

    #[test]
    fn prepare_creates_dir_and_started_record() {
        let tmp = tempdir().unwrap();
        let settings = Settings::default().with_job_dir(tmp.path().join("jobs"));
        let diag = Diagnostics::discard();
        let launcher = Launcher::new("unused", &settings, &diag);

        let spec = launcher.prepare(&request("tok")).unwrap();
        let expected_id = format!("tok.{}", std::process::id());
        assert_eq!(spec.job_id.as_str(), expected_id);
        assert_eq!(
            spec.results_file,
            tmp.path().join("jobs").join(&expected_id)
        );
        assert_eq!(spec.time_limit, Duration::from_secs(30));
        assert_eq!(spec.poll_step, settings.poll_step);
        assert_eq!(
            StatusFile::new(&spec.results_file).load().unwrap(),
            JobState::Started
        );
    }

    #[test]
    fn prepare_rejects_bad_input_without_touching_disk() {
        let tmp = tempdir().unwrap();
        let job_dir = tmp.path().join("jobs");
        let settings = Settings::default().with_job_dir(&job_dir);
        let diag = Diagnostics::discard();
        let launcher = Launcher::new("unused", &settings, &diag);

        let mut zero = request("tok");
        zero.time_limit = 0;
        assert!(matches!(
            launcher.prepare(&zero),
            Err(SetupError::TimeLimit)
        ));

        assert!(matches!(
            launcher.prepare(&request("../escape")),
            Err(SetupError::Token(_))
        ));

        let mut empty = request("tok");
        empty.module = "  ".into();
        assert!(matches!(
            launcher.prepare(&empty),
            Err(SetupError::EmptyModule)
        ));

        assert!(!job_dir.exists());
    }

    #[test]
    fn unusable_job_dir_names_the_path() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let settings = Settings::default().with_job_dir(blocker.join("jobs"));
        let diag = Diagnostics::discard();
        let err = Launcher::new("unused", &settings, &diag)
            .prepare(&request("tok"))
            .unwrap_err();
        let response = FailureResponse::from(&err);
        assert!(response.failed);
        assert_eq!(
            response.msg,
            format!("could not create: {}", blocker.join("jobs").display())
        );
    }

    #[test]
    fn launch_returns_handle_for_detached_program() {
        let tmp = tempdir().unwrap();
        let settings = Settings::default().with_job_dir(tmp.path());
        let diag = Diagnostics::discard();
        // `true` ignores the watchdog arguments and exits straight away.
        let response = Launcher::new("true", &settings, &diag)
            .launch(&request("tok"))
            .unwrap();
        assert!(response.started);
        assert_eq!(response.results_file, tmp.path().join(&response.job_id));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["started"], true);
        assert!(json["results_file"].is_string());
    }

    #[test]
    fn launch_reports_unspawnable_program() {
        let tmp = tempdir().unwrap();
        let settings = Settings::default().with_job_dir(tmp.path());
        let diag = Diagnostics::discard();
        let err = Launcher::new("/definitely/not/a/binary", &settings, &diag)
            .launch(&request("tok"))
            .unwrap_err();
        assert!(matches!(err, SetupError::Spawn(_)));
        assert!(err.to_string().starts_with("FATAL ERROR: "));
        // The started record is withdrawn with the failed spawn.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
