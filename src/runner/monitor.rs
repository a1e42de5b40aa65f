//! Progress reporting and hang detection, run on the calling thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{CounterSnapshot, RunShared};
use crate::suite::{Suite, SuiteProgress};
use std::sync::Arc;

/// How often a persisting hang is reported again
pub const HANG_REPEAT_INTERVAL: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Completion estimate in percent.
///
/// Count-bounded suites contribute the slowest suite's completion; a time
/// limit contributes elapsed time over the limit. With both, the larger wins.
pub fn completion_percent(
    progress: &[SuiteProgress],
    elapsed: Duration,
    time_limit: Option<Duration>,
) -> Option<f64> {
    let by_count = progress
        .iter()
        .filter_map(SuiteProgress::completion)
        .reduce(f64::min);
    let by_time = time_limit.map(|limit| {
        if limit.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / limit.as_secs_f64()).min(1.0)
        }
    });

    let fraction = match (by_count, by_time) {
        (Some(count), Some(time)) => count.max(time),
        (Some(count), None) => count,
        (None, Some(time)) => time,
        (None, None) => return None,
    };
    Some(fraction * 100.0)
}

/// Warns when no test completes for too long
#[derive(Debug)]
pub struct HangDetector {
    limit: Duration,
    repeat: Duration,
    last_completed: u64,
    last_progress: Instant,
    last_warning: Option<Instant>,
}

impl HangDetector {
    pub fn new(limit: Duration, now: Instant) -> Self {
        Self {
            limit,
            repeat: HANG_REPEAT_INTERVAL,
            last_completed: 0,
            last_progress: now,
            last_warning: None,
        }
    }

    /// Feed the current completion count; returns the idle time when a
    /// warning is due.
    pub fn observe(&mut self, now: Instant, completed: u64) -> Option<Duration> {
        if completed != self.last_completed {
            if self.last_warning.take().is_some() {
                info!(completed, "tests are completing again");
            }
            self.last_completed = completed;
            self.last_progress = now;
            return None;
        }

        let idle = now.saturating_duration_since(self.last_progress);
        if idle < self.limit {
            return None;
        }
        match self.last_warning {
            Some(at) if now.saturating_duration_since(at) < self.repeat => None,
            _ => {
                self.last_warning = Some(now);
                Some(idle)
            }
        }
    }
}

pub(crate) struct ProgressMonitor {
    report_interval: Duration,
    time_limit: Option<Duration>,
    started: Instant,
    hang: HangDetector,
}

impl ProgressMonitor {
    pub(crate) fn new(
        report_interval: Duration,
        inactivity_limit: Duration,
        time_limit: Option<Duration>,
        started: Instant,
    ) -> Self {
        Self {
            report_interval,
            time_limit,
            started,
            hang: HangDetector::new(inactivity_limit, started),
        }
    }

    /// Watch until every worker has exited
    pub(crate) fn watch(&mut self, shared: &RunShared, suites: &[Arc<Suite>], workers: &[JoinHandle<()>]) {
        let poll = POLL_INTERVAL.min(self.report_interval);
        let mut last_report = self.started;
        let mut previous = CounterSnapshot::default();

        while !workers.iter().all(JoinHandle::is_finished) {
            thread::sleep(poll);
            let now = Instant::now();
            let current = shared.counters.snapshot();

            if let Some(idle) = self.hang.observe(now, current.completed()) {
                warn!(
                    idle_secs = idle.as_secs(),
                    started = current.started,
                    completed = current.completed(),
                    "no test has completed recently; possible hang"
                );
            }

            if now.duration_since(last_report) >= self.report_interval {
                self.report(now, current, previous, suites);
                previous = current;
                last_report = now;
            }
        }
    }

    fn report(&self, now: Instant, current: CounterSnapshot, previous: CounterSnapshot, suites: &[Arc<Suite>]) {
        let progress: Vec<_> = suites.iter().map(|s| s.progress()).collect();
        let elapsed = now.duration_since(self.started);
        let percent = completion_percent(&progress, elapsed, self.time_limit);
        info!(
            elapsed_secs = elapsed.as_secs(),
            started = current.started,
            passed = current.passed,
            failed = current.failed + current.uncaught,
            started_delta = current.started - previous.started,
            passed_delta = current.passed - previous.passed,
            failed_delta = current.failures() - previous.failures(),
            percent = percent.map(|p| format!("{p:.1}")),
            "progress"
        );
    }
}
