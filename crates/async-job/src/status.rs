//! The status file protocol.
//!
//! A status file always holds a single JSON document. Every write replaces the
//! whole document; nothing is ever appended.
//!
//! Shapes
//! - started: `{"started": true, "job_id": ..}`
//! - success: the wrapped command's own output, passed through untouched
//! - launch failure: `{"failed": true, "cmd": .., "msg": .., "job_id": ..}`
//! - internal failure: `{"failed": true, "cmd": .., "data": .., "msg": .., "job_id": ..}`
//!
//! A job killed on timeout keeps whatever was last written, usually the
//! started record. Readers infer the timeout from wall-clock time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::job::JobId;

/// Records written by this crate. Success output is never modelled here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatusRecord {
    Started {
        started: bool,
        job_id: String,
    },
    LaunchFailure {
        failed: bool,
        cmd: String,
        msg: String,
        job_id: String,
    },
    InternalFailure {
        failed: bool,
        cmd: String,
        data: String,
        msg: String,
        job_id: String,
    },
}

impl StatusRecord {
    pub fn started(job_id: &JobId) -> Self {
        Self::Started {
            started: true,
            job_id: job_id.to_string(),
        }
    }

    pub fn launch_failure(job_id: &JobId, cmd: &str, msg: impl Into<String>) -> Self {
        Self::LaunchFailure {
            failed: true,
            cmd: cmd.to_string(),
            msg: msg.into(),
            job_id: job_id.to_string(),
        }
    }

    pub fn internal_failure(
        job_id: &JobId,
        cmd: &str,
        data: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InternalFailure {
            failed: true,
            cmd: cmd.to_string(),
            data: data.into(),
            msg: msg.into(),
            job_id: job_id.to_string(),
        }
    }
}

/// What a reader can currently tell about a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobState {
    Missing,
    /// Empty or not yet a complete document; read again later.
    Pending(String),
    Started,
    Failed(Value),
    Finished(Value),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Failed(_) | JobState::Finished(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the whole file with `record`.
    pub fn write(&self, record: &StatusRecord) -> io::Result<()> {
        let doc = serde_json::to_vec(record)?;
        fs::write(&self.path, doc)
    }

    /// Writable handle positioned at the start, without truncating, so the
    /// previous record stays readable until new bytes land on top of it.
    pub fn open_for_output(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }

    pub fn read_raw(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Best-effort classification of the current contents.
    pub fn load(&self) -> io::Result<JobState> {
        let raw = match self.read_raw() {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(JobState::Missing),
            Err(err) => return Err(err),
        };
        Ok(classify(&raw))
    }
}

fn classify(raw: &[u8]) -> JobState {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(_) => return JobState::Pending(String::from_utf8_lossy(raw).into_owned()),
    };
    if truthy(value.get("failed")) {
        JobState::Failed(value)
    } else if truthy(value.get("started")) && value.as_object().map_or(false, |m| m.len() == 2) {
        JobState::Started
    } else {
        JobState::Finished(value)
    }
}

// Older writers used `1` rather than `true`.
fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map_or(false, |n| n != 0),
        _ => false,
    }
}
