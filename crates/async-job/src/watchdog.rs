//! Time-budget supervisor.
//!
//! The watchdog runs detached from the caller, starts the worker as the leader
//! of a fresh process group and polls it every `step`. After each poll that
//! finds the worker alive the remaining budget shrinks by `step`; once it
//! reaches zero the whole group gets SIGKILL, so anything the wrapped command
//! spawned dies with it.
//!
//! The status file is never touched on the kill path. A killed job keeps
//! whatever the worker last wrote.

use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{info, info_span, warn};

use crate::config::{DEFAULT_KILL_SETTLE, DEFAULT_POLL_STEP};
use crate::diag::Diagnostics;
use crate::job::JobId;
use crate::worker::WorkerSpec;

/// Hidden subcommand the binary re-executes itself with to become a watchdog.
pub const WATCHDOG_ROLE: &str = "__watchdog";

/// Everything the detached supervisor needs, passed as arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogSpec {
    pub job_id: JobId,
    pub results_file: PathBuf,
    pub time_limit: Duration,
    pub poll_step: Duration,
    pub command: String,
    pub log_file: Option<PathBuf>,
}

impl WatchdogSpec {
    /// Arguments for `<binary> __watchdog ...`.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            WATCHDOG_ROLE.into(),
            "--job-id".into(),
            self.job_id.as_str().into(),
            "--results-file".into(),
            self.results_file.clone().into(),
            "--time-limit".into(),
            self.time_limit.as_secs().to_string().into(),
            "--poll-step-ms".into(),
            self.poll_step.as_millis().to_string().into(),
        ];
        if let Some(log) = &self.log_file {
            args.push("--log-file".into());
            args.push(log.clone().into());
        }
        args.push("--".into());
        args.push(self.command.clone().into());
        args
    }

    pub fn worker(&self) -> WorkerSpec {
        WorkerSpec {
            job_id: self.job_id.clone(),
            results_file: self.results_file.clone(),
            command: self.command.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

/// A running job as the watchdog sees it.
pub trait Supervised {
    fn pid(&self) -> u32;
    /// Non-blocking; reaps the process when it has exited.
    fn has_exited(&mut self) -> io::Result<bool>;
    /// Forcefully terminate every process in the job's group.
    fn kill_group(&mut self) -> io::Result<()>;
}

impl Supervised for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn kill_group(&mut self) -> io::Result<()> {
        // The worker leads its own group, so its pid is the group id.
        let pgid = Pid::from_raw(self.id() as i32);
        killpg(pgid, Signal::SIGKILL).map_err(io::Error::from)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed { polls: u32 },
    TimedOut { polls: u32, signalled: bool },
}

pub struct Watchdog<'a> {
    time_limit: Duration,
    step: Duration,
    kill_settle: Duration,
    diag: &'a Diagnostics,
}

impl<'a> Watchdog<'a> {
    pub fn new(time_limit: Duration, step: Duration, diag: &'a Diagnostics) -> Self {
        // A zero step would never drain the budget.
        let step = if step.is_zero() {
            DEFAULT_POLL_STEP
        } else {
            step
        };
        Self {
            time_limit,
            step,
            kill_settle: DEFAULT_KILL_SETTLE,
            diag,
        }
    }

    pub fn with_kill_settle(mut self, settle: Duration) -> Self {
        self.kill_settle = settle;
        self
    }

    /// Start `program __worker ...` as the leader of a new process group.
    pub fn spawn_worker(&self, program: &Path, spec: &WorkerSpec) -> io::Result<Child> {
        let _log = self.diag.enter();
        let child = Command::new(program)
            .args(spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        info!(job = %spec.job_id, pid = child.id(), "started worker");
        Ok(child)
    }

    /// Poll `job` until it exits or the budget runs out.
    ///
    /// `sleep` is injected so the loop can run against a virtual clock.
    pub fn supervise<S: Supervised>(
        &self,
        job: &mut S,
        mut sleep: impl FnMut(Duration),
    ) -> Outcome {
        let _log = self.diag.enter();
        let pid = job.pid();
        let _span = info_span!("watchdog", pid).entered();

        let mut remaining = self.time_limit;
        let mut polls = 0u32;
        info!(remaining_secs = remaining.as_secs(), "start watching");
        loop {
            sleep(self.step);
            polls += 1;
            match job.has_exited() {
                Ok(true) => {
                    info!(polls, "worker finished");
                    return Outcome::Completed { polls };
                }
                Ok(false) => {}
                // Keep counting down; the budget still has to be enforced.
                Err(err) => warn!(error = %err, "could not query worker"),
            }

            remaining = remaining.saturating_sub(self.step);
            if remaining.is_zero() {
                info!("now killing");
                let signalled = match job.kill_group() {
                    Ok(()) => {
                        info!("sent kill to group");
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "kill of group failed");
                        false
                    }
                };
                sleep(self.kill_settle);
                match job.has_exited() {
                    Ok(true) => {}
                    Ok(false) => warn!("worker still present after kill"),
                    Err(err) => warn!(error = %err, "could not reap worker"),
                }
                return Outcome::TimedOut { polls, signalled };
            }
            info!(remaining_secs = remaining.as_secs(), "still running");
        }
    }
}
