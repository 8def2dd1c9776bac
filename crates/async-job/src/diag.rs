//! Diagnostic breadcrumbs.
//!
//! Nothing in the job protocol depends on these messages. Each process builds
//! one `Diagnostics` at startup and hands it to the components it runs; a
//! component enters it for the duration of its work and logs through the
//! usual `tracing` macros.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::dispatcher::{self, DefaultGuard};
use tracing::Dispatch;

#[derive(Clone)]
pub struct Diagnostics {
    dispatch: Dispatch,
}

impl Diagnostics {
    /// Human-readable events on stderr.
    pub fn stderr() -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Append events to `path`, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening diagnostic log {}", path.display()))?;
        Ok(Self::to_file(file))
    }

    fn to_file(file: File) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Drops every event.
    pub fn discard() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Log file when configured and openable, stderr otherwise.
    pub fn from_log_file(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::append_to(path).unwrap_or_else(|err| {
                let fallback = Self::stderr();
                let reason = format!("{err:#}");
                {
                    let _log = fallback.enter();
                    tracing::warn!(error = %reason, "falling back to stderr");
                }
                fallback
            }),
            None => Self::stderr(),
        }
    }

    /// Route events on this thread here until the guard is dropped.
    pub fn enter(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}
