//! Runs the wrapped command and leaves exactly one terminal record.
//!
//! The command's stdout and stderr are descriptors onto the status file. The
//! file is opened without truncation, so the started record stays readable
//! until the command first writes; once it exits the file is cut to what the
//! command wrote. Faults are split in two:
//! - launch: the command could not be spawned or waited on, or its output
//!   could not be read back (any I/O fault);
//! - internal: anything else, including output that is not a JSON document.

use std::ffi::OsString;
use std::io::{self, Seek};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::anyhow;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::diag::Diagnostics;
use crate::job::JobId;
use crate::status::{StatusFile, StatusRecord};

/// Hidden subcommand the binary re-executes itself with to become a worker.
pub const WORKER_ROLE: &str = "__worker";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    pub job_id: JobId,
    pub results_file: PathBuf,
    /// Full command line, split with POSIX shell-word rules before exec.
    pub command: String,
    pub log_file: Option<PathBuf>,
}

impl WorkerSpec {
    /// Arguments for `<binary> __worker ...`.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            WORKER_ROLE.into(),
            "--job-id".into(),
            self.job_id.as_str().into(),
            "--results-file".into(),
            self.results_file.clone().into(),
        ];
        if let Some(log) = &self.log_file {
            args.push("--log-file".into());
            args.push(log.clone().into());
        }
        args.push("--".into());
        args.push(self.command.clone().into());
        args
    }
}

#[derive(Debug, Error)]
pub enum WorkerFault {
    #[error("{0}")]
    Launch(#[from] io::Error),
    #[error("{msg}")]
    Internal { data: String, msg: String },
}

impl WorkerFault {
    fn internal(data: impl Into<String>, err: anyhow::Error) -> Self {
        WorkerFault::Internal {
            data: data.into(),
            // Debug keeps the whole cause chain.
            msg: format!("{err:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerReport {
    /// The command's own output is the terminal record.
    Completed {
        exit_code: Option<i32>,
    },
    LaunchFailed,
    InternalFailed,
}

/// Write the started record, run the command, then settle the terminal record.
///
/// Only a failure to write the status file itself is returned as an error;
/// every other fault ends up in the file.
pub fn run_job(spec: &WorkerSpec, diag: &Diagnostics) -> io::Result<WorkerReport> {
    let _log = diag.enter();
    let _span = info_span!("worker", job = %spec.job_id).entered();
    let status = StatusFile::new(&spec.results_file);

    status.write(&StatusRecord::started(&spec.job_id))?;
    info!(pid = std::process::id(), "start module");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&spec.command, &status)))
        .unwrap_or_else(|payload| {
            let data = status
                .read_raw()
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                .unwrap_or_default();
            Err(WorkerFault::internal(
                data,
                anyhow!("panic: {}", panic_message(&*payload)),
            ))
        });

    let report = match outcome {
        Ok(exit_code) => {
            info!(?exit_code, "module complete");
            WorkerReport::Completed { exit_code }
        }
        Err(WorkerFault::Launch(err)) => {
            warn!(error = %err, "module could not be launched");
            status.write(&StatusRecord::launch_failure(
                &spec.job_id,
                &spec.command,
                err.to_string(),
            ))?;
            WorkerReport::LaunchFailed
        }
        Err(WorkerFault::Internal { data, msg }) => {
            warn!(error = %msg, "module failed unexpectedly");
            status.write(&StatusRecord::internal_failure(
                &spec.job_id,
                &spec.command,
                data,
                msg,
            ))?;
            WorkerReport::InternalFailed
        }
    };
    Ok(report)
}

fn execute(command: &str, status: &StatusFile) -> Result<Option<i32>, WorkerFault> {
    let argv = shell_words::split(command).map_err(|err| {
        WorkerFault::internal(
            "",
            anyhow::Error::new(err).context(format!("splitting command line {command:?}")),
        )
    })?;
    let Some((program, args)) = argv.split_first() else {
        return Err(WorkerFault::internal("", anyhow!("empty command line")));
    };

    let mut out = status.open_for_output()?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(out.try_clone()?)
        .stderr(out.try_clone()?)
        .spawn()?;
    let exit = child.wait()?;

    // The child's descriptors share this offset.
    let written = out.stream_position()?;
    out.set_len(written)?;
    drop(out);

    let raw = status.read_raw()?;
    serde_json::from_slice::<Value>(&raw).map_err(|err| {
        WorkerFault::internal(
            String::from_utf8_lossy(&raw),
            anyhow::Error::new(err).context("parsing module output"),
        )
    })?;
    Ok(exit.code())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
