//! # Execution Tracker
//!
//! Each worker thread owns one tracker. It knows which test the worker is
//! running, collects the output the test writes, folds every pass/fail signal
//! into one verdict and writes the start and terminal records of the test to
//! the execution log.
//!
//! Test code never reaches the tracker through globals. It receives a
//! [`TestContext`] and threads it explicitly, including into any threads it
//! starts with [`TestContext::spawn`].

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::adaptor::{TestAdaptor, Verdict};
use crate::execution_log::{Action, ExecutionLog, ExecutionLogError};
use crate::interceptor::{InterceptedWriter, OutputInterceptor, StreamKind};
use crate::inventory::TestUnit;

pub const TRUNCATION_MARKER: &[u8] = b"[... earlier output truncated ...]\n";

struct ActiveTest {
    unit: Arc<TestUnit>,
    adaptor: Arc<dyn TestAdaptor>,
}

#[derive(Default)]
struct TrackerState {
    current: Option<ActiveTest>,
    output: Vec<u8>,
    truncated: bool,
    verdict: Verdict,
}

/// Result of finishing one test execution
#[derive(Debug)]
pub struct TestCompletion {
    pub test: Option<Arc<TestUnit>>,
    pub verdict: Verdict,
    pub action: Action,
    pub passed: bool,
    pub output: Vec<u8>,
    /// Set when the terminal record could not be written
    pub log_error: Option<ExecutionLogError>,
}

pub struct ExecutionTracker {
    thread_id: u32,
    suite_id: u32,
    log: Arc<ExecutionLog>,
    capture_limit: usize,
    state: Mutex<TrackerState>,
}

impl ExecutionTracker {
    pub fn new(thread_id: u32, suite_id: u32, log: Arc<ExecutionLog>, capture_limit: usize) -> Self {
        Self {
            thread_id,
            suite_id,
            log,
            capture_limit,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn suite_id(&self) -> u32 {
        self.suite_id
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn current_test(&self) -> Option<Arc<TestUnit>> {
        self.state.lock().current.as_ref().map(|t| t.unit.clone())
    }

    /// Reset capture state and record that `unit` started
    pub fn start_test(
        &self,
        unit: Arc<TestUnit>,
        adaptor: Arc<dyn TestAdaptor>,
    ) -> Result<(), ExecutionLogError> {
        let test_id = unit.id();
        {
            let mut state = self.state.lock();
            *state = TrackerState {
                current: Some(ActiveTest { unit, adaptor }),
                ..TrackerState::default()
            };
        }
        self.log
            .log(Action::Started, self.thread_id, self.suite_id, test_id, &[])
    }

    /// Take output written by the active test.
    ///
    /// Returns false when no test is active so the caller can pass the
    /// bytes through instead.
    pub fn capture(&self, bytes: &[u8]) -> bool {
        let adaptor = {
            let mut state = self.state.lock();
            let Some(active) = state.current.as_ref() else {
                return false;
            };
            let adaptor = active.adaptor.clone();

            state.output.extend_from_slice(bytes);
            if state.output.len() > self.capture_limit {
                let excess = state.output.len() - self.capture_limit;
                state.output.drain(..excess);
                state.truncated = true;
            }
            adaptor
        };

        // Scan outside the lock; adaptors may be slow
        let signal = adaptor.check_output(bytes);
        if signal != Verdict::NoResult {
            let mut state = self.state.lock();
            if state.current.is_some() {
                state.verdict = state.verdict.combine(signal);
            }
        }
        true
    }

    /// Verdict accumulated from output so far
    pub fn verdict(&self) -> Verdict {
        self.state.lock().verdict
    }

    /// Finish the active test with the verdict its adaptor returned
    pub fn finish_test(&self, returned: Verdict) -> TestCompletion {
        let (test, verdict, output) = self.take(returned);
        self.complete(test, verdict, Action::from_verdict(verdict), output)
    }

    /// Finish the active test that raised an error or panicked
    pub fn finish_with_error(&self, message: &str) -> TestCompletion {
        let (test, verdict, mut output) = self.take(Verdict::Failed);
        if !output.is_empty() && !output.ends_with(b"\n") {
            output.push(b'\n');
        }
        output.extend_from_slice(message.as_bytes());
        self.complete(test, verdict, Action::FailedThrowable, output)
    }

    fn take(&self, returned: Verdict) -> (Option<Arc<TestUnit>>, Verdict, Vec<u8>) {
        let state = std::mem::take(&mut *self.state.lock());
        let verdict = state.verdict.combine(returned);
        let output = if state.truncated {
            let mut marked = TRUNCATION_MARKER.to_vec();
            marked.extend_from_slice(&state.output);
            marked
        } else {
            state.output
        };
        (state.current.map(|t| t.unit), verdict, output)
    }

    fn complete(
        &self,
        test: Option<Arc<TestUnit>>,
        verdict: Verdict,
        action: Action,
        output: Vec<u8>,
    ) -> TestCompletion {
        let log_error = match &test {
            Some(unit) => self
                .log
                .log(action, self.thread_id, self.suite_id, unit.id(), &output)
                .err(),
            None => {
                debug!(thread = self.thread_id, "finish called without an active test");
                None
            }
        };
        TestCompletion {
            test,
            verdict,
            action,
            passed: !action.is_failure(),
            output,
            log_error,
        }
    }
}

impl std::fmt::Debug for ExecutionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTracker")
            .field("thread_id", &self.thread_id)
            .field("suite_id", &self.suite_id)
            .finish_non_exhaustive()
    }
}

/// What a running test gets: where its output goes, and its tracker
#[derive(Debug, Clone)]
pub struct TestContext {
    tracker: Arc<ExecutionTracker>,
    interceptor: Arc<OutputInterceptor>,
}

impl TestContext {
    pub fn new(tracker: Arc<ExecutionTracker>, interceptor: Arc<OutputInterceptor>) -> Self {
        Self {
            tracker,
            interceptor,
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn stdout(&self) -> InterceptedWriter {
        self.interceptor
            .writer(StreamKind::Stdout, Some(self.tracker.clone()))
    }

    pub fn stderr(&self) -> InterceptedWriter {
        self.interceptor
            .writer(StreamKind::Stderr, Some(self.tracker.clone()))
    }

    /// Start a named thread whose output is attributed to the same test
    pub fn spawn<F, T>(&self, name: &str, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce(TestContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let parent = thread::current();
        let thread_name = format!("{}-{}", parent.name().unwrap_or("test"), name);
        let ctx = self.clone();
        thread::Builder::new().name(thread_name).spawn(move || f(ctx))
    }
}
