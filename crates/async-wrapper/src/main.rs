//! `async-wrapper <jid> <time_limit> <module> [argsfile]`
//!
//! Prints `{"started": true, "job_id", "results_file"}` and returns while the
//! module keeps running in a detached watchdog/worker tree. The same binary is
//! re-executed in the hidden `__watchdog` and `__worker` roles to build that
//! tree.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use async_job::launcher::FailureResponse;
use async_job::status::{StatusFile, StatusRecord};
use async_job::worker::run_job;
use async_job::{
    Diagnostics, JobId, LaunchRequest, Launcher, Settings, Watchdog, WatchdogSpec, WorkerSpec,
};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

const USAGE: &str =
    "usage: async-wrapper <jid> <time_limit> <modulescript> [argsfile]. Not meant to be called by hand";

#[derive(Parser)]
#[command(name = "async-wrapper", version)]
#[command(about = "Run a module detached from the caller under a time limit")]
#[command(args_conflicts_with_subcommands = true)]
#[command(disable_help_subcommand = true)]
struct Cmd {
    /// Correlation token; the job id is `<jid>.<pid>`
    jid: Option<String>,
    /// Wall-clock budget in seconds
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    time_limit: Option<u64>,
    /// Module to execute (split with shell-word rules)
    module: Option<String>,
    /// Arguments file appended to the module command line
    argsfile: Option<String>,

    /// Where status files are kept
    #[arg(long, env = "ASYNC_JOB_DIR")]
    job_dir: Option<PathBuf>,
    /// Seconds between watchdog polls
    #[arg(long, env = "ASYNC_JOB_POLL_STEP", value_parser = clap::value_parser!(u64).range(1..))]
    poll_step: Option<u64>,
    /// Append diagnostics to this file instead of stderr
    #[arg(long, env = "ASYNC_JOB_LOG")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand)]
enum Role {
    #[command(name = "__watchdog", hide = true)]
    Watchdog {
        #[arg(long)]
        job_id: JobId,
        #[arg(long)]
        results_file: PathBuf,
        #[arg(long)]
        time_limit: u64,
        #[arg(long)]
        poll_step_ms: u64,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: String,
    },
    #[command(name = "__worker", hide = true)]
    Worker {
        #[arg(long)]
        job_id: JobId,
        #[arg(long)]
        results_file: PathBuf,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: String,
    },
}

fn main() -> Result<ExitCode> {
    let cmd = match Cmd::try_parse() {
        Ok(cmd) => cmd,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
            _ => return fail(format!("{} ({USAGE})", clap_reason(&err))),
        },
    };

    match cmd.role {
        Some(Role::Watchdog {
            job_id,
            results_file,
            time_limit,
            poll_step_ms,
            log_file,
            command,
        }) => watchdog(WatchdogSpec {
            job_id,
            results_file,
            time_limit: Duration::from_secs(time_limit),
            poll_step: Duration::from_millis(poll_step_ms),
            command,
            log_file,
        }),
        Some(Role::Worker {
            job_id,
            results_file,
            log_file,
            command,
        }) => worker(WorkerSpec {
            job_id,
            results_file,
            command,
            log_file,
        }),
        None => launch(cmd),
    }
}

fn launch(cmd: Cmd) -> Result<ExitCode> {
    let (Some(token), Some(time_limit), Some(module)) = (cmd.jid, cmd.time_limit, cmd.module)
    else {
        return fail(USAGE);
    };
    let mut settings = Settings::default().with_log_file(cmd.log_file);
    if let Some(dir) = cmd.job_dir {
        settings = settings.with_job_dir(dir);
    }
    if let Some(step) = cmd.poll_step {
        settings = settings.with_poll_step(Duration::from_secs(step));
    }
    let diag = Diagnostics::from_log_file(settings.log_file.as_deref());

    let program = match std::env::current_exe() {
        Ok(program) => program,
        Err(err) => return fail(format!("FATAL ERROR: locating own executable: {err}")),
    };
    let request = LaunchRequest {
        token,
        time_limit,
        module,
        args_file: cmd.argsfile,
    };
    match Launcher::new(program, &settings, &diag).launch(&request) {
        Ok(response) => {
            respond(&response)?;
            // Let the worker read its inputs before the caller cleans them up.
            std::thread::sleep(settings.startup_grace);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            {
                let _log = diag.enter();
                error!(error = %err, "job not started");
            }
            fail(FailureResponse::from(&err).msg)
        }
    }
}

fn watchdog(spec: WatchdogSpec) -> Result<ExitCode> {
    let diag = Diagnostics::from_log_file(spec.log_file.as_deref());
    let dog = Watchdog::new(spec.time_limit, spec.poll_step, &diag);
    let worker_spec = spec.worker();

    let spawned =
        std::env::current_exe().and_then(|program| dog.spawn_worker(&program, &worker_spec));
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            // No worker means nobody else will ever settle the file. This is
            // the only status write the watchdog makes; the kill path makes none.
            let _log = diag.enter();
            error!(job = %spec.job_id, error = %err, "could not start worker");
            StatusFile::new(&spec.results_file)
                .write(&StatusRecord::launch_failure(
                    &spec.job_id,
                    &spec.command,
                    err.to_string(),
                ))
                .with_context(|| format!("writing {}", spec.results_file.display()))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let outcome = dog.supervise(&mut child, std::thread::sleep);
    let _log = diag.enter();
    info!(job = %spec.job_id, ?outcome, "watchdog done");
    Ok(ExitCode::SUCCESS)
}

fn worker(spec: WorkerSpec) -> Result<ExitCode> {
    let diag = Diagnostics::from_log_file(spec.log_file.as_deref());
    let report = run_job(&spec, &diag)
        .with_context(|| format!("writing {}", spec.results_file.display()))?;
    let _log = diag.enter();
    info!(job = %spec.job_id, ?report, "worker done");
    Ok(ExitCode::SUCCESS)
}

fn respond<T: Serialize>(doc: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, doc)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn fail(msg: impl Into<String>) -> Result<ExitCode> {
    respond(&FailureResponse::new(msg))?;
    Ok(ExitCode::FAILURE)
}

/// First line of clap's message without the `error: ` prefix.
fn clap_reason(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.trim_start_matches("error: ").to_string()
}
