//! Detached, time-bounded execution of a single command.
//!
//! A job is launched so that it outlives its caller. The caller gets a job id
//! and the path of a status file right away; the outcome is written into that
//! file later by a background process tree.
//!
//! Process tree
//! - `launcher`: foreground. Validates input, allocates the job, spawns the
//!   supervisor in a new session and returns.
//! - `watchdog`: supervisor. Spawns the worker as a process-group leader,
//!   polls it and kills the whole group once the time budget runs out.
//! - `worker`: runs the wrapped command with its output redirected into the
//!   status file and leaves exactly one terminal record.
//!
//! Unix only: detachment relies on `setsid`, `setpgid` and `killpg`.

pub mod config;
pub mod diag;
pub mod job;
pub mod launcher;
pub mod status;
pub mod watchdog;
pub mod worker;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Settings;
pub use diag::Diagnostics;
pub use job::{JobId, JobIdError};
pub use launcher::{FailureResponse, LaunchRequest, LaunchResponse, Launcher, SetupError};
pub use status::{JobState, StatusFile, StatusRecord};
pub use watchdog::{Outcome, Supervised, Watchdog, WatchdogSpec};
pub use worker::{WorkerFault, WorkerReport, WorkerSpec};
