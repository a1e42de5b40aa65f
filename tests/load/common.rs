#![allow(dead_code)]

use anyhow::Result;
use loadtest_engine::adaptor::{AdaptorRegistry, TestAdaptor, TestError, Verdict};
use loadtest_engine::diagnostics::{DiagnosticDumper, FailureReport};
use loadtest_engine::execution_log::{Action, ExecutionLogReader};
use loadtest_engine::interceptor::OutputInterceptor;
use loadtest_engine::inventory::{AdaptorKind, Inventory, TestUnit};
use loadtest_engine::runner::{LoadTestRunner, RunSettings};
use loadtest_engine::suite::{Suite, SuiteSettings};
use loadtest_engine::tracker::TestContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Behaviour =
    Arc<dyn Fn(&TestUnit, &TestContext) -> Result<Verdict, TestError> + Send + Sync>;

/// Adaptor whose outcome is chosen per test class
#[derive(Clone, Default)]
pub struct ScriptedAdaptor {
    behaviours: HashMap<String, Behaviour>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, class: &str, behaviour: F) -> Self
    where
        F: Fn(&TestUnit, &TestContext) -> Result<Verdict, TestError> + Send + Sync + 'static,
    {
        self.behaviours.insert(class.to_string(), Arc::new(behaviour));
        self
    }

    pub fn passing(self, class: &str) -> Self {
        self.on(class, |_, _| Ok(Verdict::Passed))
    }

    pub fn failing(self, class: &str) -> Self {
        self.on(class, |_, ctx| {
            writeln!(ctx.stdout(), "assertion failed").map_err(|e| TestError::Failed(e.to_string()))?;
            Ok(Verdict::Failed)
        })
    }

    /// Names of executed tests, in completion order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn registry(self) -> AdaptorRegistry {
        AdaptorRegistry::new().with(AdaptorKind::JUnit, Arc::new(self))
    }
}

impl TestAdaptor for ScriptedAdaptor {
    fn execute(&self, unit: &TestUnit, ctx: &TestContext) -> Result<Verdict, TestError> {
        let result = match self.behaviours.get(unit.class()) {
            Some(behaviour) => behaviour(unit, ctx),
            None => Ok(Verdict::Passed),
        };
        self.executed.lock().push(unit.name());
        result
    }
}

/// Dumper that only counts how often it is asked to dump
#[derive(Default)]
pub struct CountingDumper {
    pub calls: AtomicUsize,
}

impl DiagnosticDumper for CountingDumper {
    fn dump(&self, _report: &FailureReport) -> io::Result<Vec<PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

impl CountingDumper {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// JUnit-kind inventory with one test per class name
pub fn inventory(classes: &[&str]) -> Inventory {
    let units = classes
        .iter()
        .enumerate()
        .map(|(id, class)| TestUnit::new(id as u32, AdaptorKind::JUnit, *class))
        .collect();
    Inventory::from_units("inline", units)
}

pub fn suite(classes: &[&str], settings: SuiteSettings) -> Suite {
    Suite::new(0, inventory(classes), settings).expect("valid suite")
}

/// Settings with fast reporting, for runs that last well under a second
pub fn settings(dir: &Path) -> RunSettings {
    let mut settings = RunSettings::new(dir);
    settings.report_interval = Duration::from_millis(100);
    settings.inactivity_limit = Duration::from_secs(5);
    settings
}

pub fn runner(settings: RunSettings, suites: Vec<Suite>, registry: AdaptorRegistry) -> Result<LoadTestRunner> {
    Ok(LoadTestRunner::new(settings, suites, registry)?
        .with_interceptor(Arc::new(OutputInterceptor::discarding())))
}

/// Actions and test names of every logged record
pub fn logged(dir: &Path) -> Result<Vec<(Action, String)>> {
    let reader = ExecutionLogReader::open(dir)?;
    Ok(reader
        .events()?
        .into_iter()
        .map(|e| (e.action, e.test_name.unwrap_or_default()))
        .collect())
}
