use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{AbortReason, CounterSnapshot, RunState};
use crate::suite::{SelectionMode, Suite};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Serialize)]
pub struct SuiteSummary {
    pub suite_id: u32,
    pub inventory: String,
    pub threads: u32,
    pub tests: usize,
    pub mode: SelectionMode,
    pub seed: u64,
    pub multiplier: u32,
    pub issued: u64,
}

impl SuiteSummary {
    pub fn of(suite: &Suite) -> Self {
        Self {
            suite_id: suite.id(),
            inventory: suite.inventory().reference().to_string(),
            threads: suite.threads(),
            tests: suite.inventory().len(),
            mode: suite.mode(),
            seed: suite.seed(),
            multiplier: suite.table().multiplier(),
            issued: suite.progress().issued,
        }
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub started: u64,
    pub passed: u64,
    pub failed: u64,
    /// Tests that raised an error or panicked
    pub uncaught: u64,
    pub internal_errors: u64,
    pub abort_reason: Option<AbortReason>,
    pub first_failure_dumped: bool,
    pub suites: Vec<SuiteSummary>,
}

impl RunSummary {
    pub(crate) fn new(
        state: RunState,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        counters: CounterSnapshot,
        abort_reason: Option<AbortReason>,
        first_failure_dumped: bool,
        suites: Vec<SuiteSummary>,
    ) -> Self {
        Self {
            state,
            started_at,
            duration_ms,
            started: counters.started,
            passed: counters.passed,
            failed: counters.failed,
            uncaught: counters.uncaught,
            internal_errors: counters.internal_errors,
            abort_reason,
            first_failure_dumped,
            suites,
        }
    }

    pub fn failures(&self) -> u64 {
        self.failed + self.uncaught
    }

    /// 0 when every test passed, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.failures() == 0 {
            0
        } else {
            1
        }
    }

    pub fn log(&self) {
        if self.failures() == 0 && self.abort_reason.is_none() {
            info!(
                state = %self.state,
                started = self.started,
                passed = self.passed,
                failed = self.failed,
                uncaught = self.uncaught,
                internal_errors = self.internal_errors,
                duration_ms = self.duration_ms,
                "load test finished"
            );
        } else {
            warn!(
                state = %self.state,
                started = self.started,
                passed = self.passed,
                failed = self.failed,
                uncaught = self.uncaught,
                internal_errors = self.internal_errors,
                duration_ms = self.duration_ms,
                abort_reason = ?self.abort_reason,
                "load test finished with failures"
            );
        }
    }

    pub fn write_json(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}
