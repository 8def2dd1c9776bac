//! Job identity and the job directory.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id must not be empty")]
    Empty,
    #[error("job id {0:?} is not a valid file name")]
    NotAFileName(String),
}

/// `<token>.<pid>`; also the status file's name inside the job directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    /// Combine the caller's correlation token with the allocating process id.
    pub fn new(token: &str, pid: u32) -> Result<Self, JobIdError> {
        validate_component(token)?;
        Ok(Self(format!("{token}.{pid}")))
    }

    /// Id for a job allocated by the current process.
    pub fn for_current_process(token: &str) -> Result<Self, JobIdError> {
        Self::new(token, std::process::id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic status file location for this job.
    pub fn results_file(&self, job_dir: &Path) -> PathBuf {
        job_dir.join(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_component(s)?;
        Ok(Self(s.to_string()))
    }
}

fn validate_component(s: &str) -> Result<(), JobIdError> {
    if s.is_empty() {
        return Err(JobIdError::Empty);
    }
    if s == "." || s == ".." || s.contains('/') || s.contains('\0') {
        return Err(JobIdError::NotAFileName(s.to_string()));
    }
    Ok(())
}

/// Create the job directory (and parents) unless it already exists.
pub fn ensure_job_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn id_joins_token_and_pid() {
        let id = JobId::new("529421305453.7", 4242).unwrap();
        assert_eq!(id.as_str(), "529421305453.7.4242");
        assert_eq!(id.to_string(), "529421305453.7.4242");
    }

    #[test]
    fn rejects_tokens_that_are_not_file_names() {
        assert_eq!(JobId::new("", 1), Err(JobIdError::Empty));
        for bad in [".", "..", "a/b", "/abs", "nul\0byte"] {
            assert!(
                matches!(JobId::new(bad, 1), Err(JobIdError::NotAFileName(_))),
                "{bad:?} accepted"
            );
        }
        assert!("x/y".parse::<JobId>().is_err());
    }

    #[test]
    fn distinct_tokens_never_share_a_results_file() {
        let dir = Path::new("/home/u/.async_jobs");
        let a = JobId::new("job-a", 100).unwrap().results_file(dir);
        let b = JobId::new("job-b", 100).unwrap().results_file(dir);
        assert_ne!(a, b);
        assert_eq!(a, dir.join("job-a.100"));
    }

    #[test]
    fn parse_round_trips_display() {
        let id = JobId::new("tok", 9).unwrap();
        let again: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn ensure_job_dir_creates_nested_and_tolerates_existing() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("home/.async_jobs");
        ensure_job_dir(&dir).unwrap();
        assert!(dir.is_dir());
        ensure_job_dir(&dir).unwrap();
    }

    #[test]
    fn ensure_job_dir_fails_when_a_file_is_in_the_way() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        assert!(ensure_job_dir(&blocker.join("jobs")).is_err());
    }
}
