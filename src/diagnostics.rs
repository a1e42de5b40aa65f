//! First-failure diagnostics.
//!
//! The first failing test of a run triggers one diagnostic dump. Later
//! failures, including ones racing on other workers, never dump again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::execution_log::Action;

pub const FIRST_FAILURE_FILE: &str = "first_failure.txt";

/// Details of a failed test execution
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub suite_id: u32,
    pub thread: String,
    pub test_id: u32,
    pub test_name: String,
    pub action: Action,
    pub message: Option<String>,
    #[serde(skip)]
    pub output: Vec<u8>,
    pub at: DateTime<Utc>,
}

impl FailureReport {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Produces diagnostic artifacts for a failure
#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticDumper: Send + Sync {
    /// Write the diagnostics, returning the files created
    fn dump(&self, report: &FailureReport) -> io::Result<Vec<PathBuf>>;
}

/// Writes a text report with the failing worker's stack into a directory
#[derive(Debug, Clone)]
pub struct FileDumper {
    dir: PathBuf,
}

impl FileDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiagnosticDumper for FileDumper {
    fn dump(&self, report: &FailureReport) -> io::Result<Vec<PathBuf>> {
        let path = self.dir.join(FIRST_FAILURE_FILE);
        let mut text = format!(
            "first failure at {}\nsuite: {}\nthread: {}\ntest: {} (id {})\naction: {}\n",
            report.at.to_rfc3339(),
            report.suite_id,
            report.thread,
            report.test_name,
            report.test_id,
            report.action,
        );
        if let Some(message) = &report.message {
            text.push_str(&format!("message: {message}\n"));
        }
        text.push_str("\n--- captured output ---\n");
        text.push_str(&report.output_text());
        text.push_str("\n--- worker stack ---\n");
        text.push_str(&Backtrace::force_capture().to_string());

        fs::create_dir_all(&self.dir)?;
        fs::write(&path, text)?;
        Ok(vec![path])
    }
}

/// At-most-once dump guard shared by all workers
pub struct FirstFailureDump {
    enabled: bool,
    fired: AtomicBool,
    dumper: Arc<dyn DiagnosticDumper>,
}

impl FirstFailureDump {
    pub fn new(enabled: bool, dumper: Arc<dyn DiagnosticDumper>) -> Self {
        Self {
            enabled,
            fired: AtomicBool::new(false),
            dumper,
        }
    }

    /// Dump for `report` if this is the run's first failure.
    /// Returns true for the one caller that performed the dump.
    pub fn on_failure(&self, report: &FailureReport) -> bool {
        if !self.enabled {
            return false;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match self.dumper.dump(report) {
            Ok(files) => info!(
                test = %report.test_name,
                files = ?files,
                "first-failure diagnostics written"
            ),
            Err(e) => error!(
                test = %report.test_name,
                error = %e,
                "failed to write first-failure diagnostics"
            ),
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FirstFailureDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstFailureDump")
            .field("enabled", &self.enabled)
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}
