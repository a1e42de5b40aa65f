//! # Load Test Runner
//!
//! Starts one OS thread per (suite, thread slot), watches them from the
//! calling thread, and produces a [`RunSummary`] once every worker has
//! stopped.
//!
//! Workers stop when their suite runs out of tests, when the time limit has
//! passed, or when the shared abort flag is set. The abort flag is set by the
//! failure limit, by an out-of-memory test, or externally through a
//! [`RunHandle`]. A worker always finishes the test it is running first.

mod monitor;
mod summary;
mod worker;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub use monitor::{completion_percent, HangDetector, HANG_REPEAT_INTERVAL};
pub use summary::{RunSummary, SuiteSummary, SUMMARY_FILE};

use crate::adaptor::AdaptorRegistry;
use crate::config::{Config, ConfigError, LogConfig, RunConfig};
use crate::diagnostics::{DiagnosticDumper, FileDumper, FirstFailureDump};
use crate::execution_log::{
    ExecutionLog, ExecutionLogError, LogLimits, RunMetadata, SuiteMetadata, TestName,
};
use crate::interceptor::OutputInterceptor;
use crate::inventory::{AdaptorKind, IdAllocator, Inventory, InventoryError};
use crate::suite::{Suite, SuiteError};
use crate::tracker::{ExecutionTracker, TestContext};
use monitor::ProgressMonitor;
use worker::{FailurePolicy, Worker};

const ORDER: Ordering = Ordering::Relaxed;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Suite(#[from] SuiteError),

    #[error(transparent)]
    Log(#[from] ExecutionLogError),

    #[error("suite {suite} uses adaptor kind '{kind}' but no adaptor is registered for it")]
    MissingAdaptor { suite: u32, kind: AdaptorKind },

    #[error("cannot prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no suites to run")]
    NoSuites,
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    Unstarted,
    Running,
    /// Completed with every test passing
    Passed,
    /// Completed with at least one failure
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    OutOfMemory,
    FailureLimit,
    External,
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub started: u64,
    pub passed: u64,
    pub failed: u64,
    pub uncaught: u64,
    pub internal_errors: u64,
}

impl CounterSnapshot {
    pub fn failures(&self) -> u64 {
        self.failed + self.uncaught
    }

    pub fn completed(&self) -> u64 {
        self.passed + self.failures()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    started: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
    uncaught: AtomicU64,
    internal_errors: AtomicU64,
    /// Failure ordinal source, failed + uncaught
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            started: self.started.load(ORDER),
            passed: self.passed.load(ORDER),
            failed: self.failed.load(ORDER),
            uncaught: self.uncaught.load(ORDER),
            internal_errors: self.internal_errors.load(ORDER),
        }
    }
}

#[derive(Debug)]
pub(crate) struct RunShared {
    counters: Counters,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,
    state: Mutex<RunState>,
}

impl RunShared {
    fn new() -> Self {
        Self {
            counters: Counters::default(),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            state: Mutex::new(RunState::Unstarted),
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Set the abort flag; the first reason given is kept
    fn request_abort(&self, reason: AbortReason) {
        let mut current = self.abort_reason.lock();
        if current.is_none() {
            *current = Some(reason);
            warn!(reason = %reason, "aborting run; workers stop after their current test");
        }
        self.aborted.store(true, Ordering::Release);
    }
}

/// Cloneable handle for observing and aborting a run from another thread
#[derive(Debug, Clone)]
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl RunHandle {
    pub fn abort(&self) {
        self.shared.request_abort(AbortReason::External);
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    pub fn state(&self) -> RunState {
        *self.shared.state.lock()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }
}

/// Run-wide settings
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub results_dir: PathBuf,
    pub time_limit: Option<Duration>,
    pub inactivity_limit: Duration,
    pub report_interval: Duration,
    pub abort_if_out_of_memory: bool,
    pub report_failure_limit: u32,
    /// 0 = never abort on failures
    pub abort_at_failure_limit: u64,
    pub dump_on_first_failure: bool,
    pub timezone: String,
    pub capture_limit: usize,
    pub log_limits: LogLimits,
}

impl RunSettings {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(
            &RunConfig {
                results_dir: results_dir.into(),
                ..RunConfig::default()
            },
            &LogConfig::default(),
        )
    }

    pub fn from_config(run: &RunConfig, log: &LogConfig) -> Self {
        Self {
            results_dir: run.results_dir.clone(),
            time_limit: run.time_limit.map(|t| t.duration()),
            inactivity_limit: run.inactivity_limit.duration(),
            report_interval: run.report_interval.duration(),
            abort_if_out_of_memory: run.abort_if_out_of_memory,
            report_failure_limit: run.report_failure_limit,
            abort_at_failure_limit: run.abort_at_failure_limit,
            dump_on_first_failure: run.dump_on_first_failure,
            timezone: run.timezone.clone(),
            capture_limit: usize::try_from(run.capture_limit.bytes()).unwrap_or(usize::MAX),
            log_limits: log.limits(),
        }
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            report_failure_limit: self.report_failure_limit,
            abort_at_failure_limit: self.abort_at_failure_limit,
            abort_if_out_of_memory: self.abort_if_out_of_memory,
        }
    }
}

pub struct LoadTestRunner {
    settings: RunSettings,
    suites: Vec<Arc<Suite>>,
    registry: AdaptorRegistry,
    interceptor: Arc<OutputInterceptor>,
    dumper: Arc<dyn DiagnosticDumper>,
    shared: Arc<RunShared>,
}

impl LoadTestRunner {
    /// Check that every suite's adaptor kinds are registered
    pub fn new(
        settings: RunSettings,
        suites: Vec<Suite>,
        registry: AdaptorRegistry,
    ) -> Result<Self, RunError> {
        if suites.is_empty() {
            return Err(RunError::NoSuites);
        }
        for suite in &suites {
            let mut kinds: Vec<_> = suite.inventory().kinds().into_iter().collect();
            kinds.sort_by_key(|k| k.to_string());
            if let Some(kind) = kinds.into_iter().find(|k| !registry.supports(*k)) {
                return Err(RunError::MissingAdaptor {
                    suite: suite.id(),
                    kind,
                });
            }
        }

        let dumper = Arc::new(FileDumper::new(settings.results_dir.clone()));
        Ok(Self {
            settings,
            suites: suites.into_iter().map(Arc::new).collect(),
            registry,
            interceptor: Arc::new(OutputInterceptor::process()),
            dumper,
            shared: Arc::new(RunShared::new()),
        })
    }

    /// Load every configured inventory and build the suites
    pub fn from_config(config: &Config, registry: AdaptorRegistry) -> Result<Self, RunError> {
        config.validate()?;
        let ids = IdAllocator::new();
        let mut suites = Vec::with_capacity(config.suites.len());
        for (index, suite_config) in config.suites.iter().enumerate() {
            let inventory = Inventory::load(&suite_config.inventory, &suite_config.exclude, &ids)?;
            info!(
                suite = index,
                inventory = %inventory.reference(),
                tests = inventory.len(),
                "inventory loaded"
            );
            suites.push(Suite::new(index as u32, inventory, suite_config.settings())?);
        }
        Self::new(RunSettings::from_config(&config.run, &config.log), suites, registry)
    }

    pub fn with_interceptor(mut self, interceptor: Arc<OutputInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn DiagnosticDumper>) -> Self {
        self.dumper = dumper;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn suites(&self) -> &[Arc<Suite>] {
        &self.suites
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            shared: self.shared.clone(),
        }
    }

    fn metadata(&self) -> RunMetadata {
        let suites = self
            .suites
            .iter()
            .map(|suite| SuiteMetadata {
                suite_id: suite.id(),
                threads: suite.threads(),
                inventory: suite.inventory().reference().to_string(),
                tests: suite
                    .inventory()
                    .units()
                    .iter()
                    .map(|u| TestName {
                        id: u.id(),
                        name: u.name(),
                    })
                    .collect(),
            })
            .collect();
        RunMetadata::new(self.settings.timezone.clone(), suites)
    }

    /// Run every suite to completion and return the summary.
    ///
    /// Errors are only returned for setup failures before any test runs.
    pub fn run(self) -> Result<RunSummary, RunError> {
        let dir = self.settings.results_dir.clone();
        fs::create_dir_all(&dir).map_err(|source| RunError::Io {
            path: dir.clone(),
            source,
        })?;

        let metadata = self.metadata();
        let started = Instant::now();
        let started_at = Utc::now();
        let log = Arc::new(ExecutionLog::create_at(
            &dir,
            self.settings.log_limits,
            metadata.with_base_timestamp(started_at.timestamp_millis()),
            started,
        )?);
        let dump = Arc::new(FirstFailureDump::new(
            self.settings.dump_on_first_failure,
            self.dumper.clone(),
        ));

        let deadline = self.settings.time_limit.map(|limit| started + limit);
        *self.shared.state.lock() = RunState::Running;
        info!(
            suites = self.suites.len(),
            threads = self.suites.iter().map(|s| s.threads()).sum::<u32>(),
            time_limit_secs = self.settings.time_limit.map(|t| t.as_secs()),
            results_dir = %dir.display(),
            "load test started"
        );

        let workers = match self.spawn_workers(&log, &dump, deadline) {
            Ok(workers) => workers,
            Err(e) => {
                *self.shared.state.lock() = RunState::Aborted;
                return Err(e);
            }
        };

        let mut monitor = ProgressMonitor::new(
            self.settings.report_interval,
            self.settings.inactivity_limit,
            self.settings.time_limit,
            started,
        );
        monitor.watch(&self.shared, &self.suites, &workers);

        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                self.shared.counters.internal_errors.fetch_add(1, ORDER);
                error!(worker = %name, "worker thread panicked outside a test");
            }
        }

        if let Err(e) = log.close() {
            self.shared.counters.internal_errors.fetch_add(1, ORDER);
            error!(error = %e, "failed to close execution log");
        }
        if let Err(e) = self.interceptor.flush() {
            warn!(error = %e, "failed to flush output streams");
        }

        let counters = self.shared.counters.snapshot();
        let abort_reason = *self.shared.abort_reason.lock();
        let state = if abort_reason.is_some() {
            RunState::Aborted
        } else if counters.failures() == 0 {
            RunState::Passed
        } else {
            RunState::Failed
        };
        *self.shared.state.lock() = state;

        let summary = RunSummary::new(
            state,
            started_at,
            started.elapsed().as_millis() as u64,
            counters,
            abort_reason,
            dump.has_fired(),
            self.suites.iter().map(|s| SuiteSummary::of(s)).collect(),
        );
        summary.log();
        if let Err(e) = summary.write_json(&dir) {
            error!(error = %e, "failed to write run summary");
        }
        Ok(summary)
    }

    fn spawn_workers(
        &self,
        log: &Arc<ExecutionLog>,
        dump: &Arc<FirstFailureDump>,
        deadline: Option<Instant>,
    ) -> Result<Vec<JoinHandle<()>>, RunError> {
        let mut handles = Vec::new();
        let mut thread_id = 0u32;

        for suite in &self.suites {
            for slot in 0..suite.threads() {
                let name = format!("load-{}-{}", suite.id(), slot);
                let tracker = Arc::new(ExecutionTracker::new(
                    thread_id,
                    suite.id(),
                    log.clone(),
                    self.settings.capture_limit,
                ));
                thread_id += 1;

                let worker = Worker {
                    name: name.clone(),
                    suite: suite.clone(),
                    context: TestContext::new(tracker, self.interceptor.clone()),
                    registry: self.registry.clone(),
                    shared: self.shared.clone(),
                    dump: dump.clone(),
                    policy: self.settings.failure_policy(),
                    deadline,
                };

                match thread::Builder::new().name(name.clone()).spawn(move || worker.run()) {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        self.shared.aborted.store(true, Ordering::Release);
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(RunError::Spawn { name, source });
                    }
                }
            }
        }
        Ok(handles)
    }
}
