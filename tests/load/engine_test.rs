//! Runner behaviour under failures, limits and aborts.

use super::common::{logged, runner, settings, suite, CountingDumper, ScriptedAdaptor};
use loadtest_engine::adaptor::{TestError, Verdict};
use loadtest_engine::diagnostics::FIRST_FAILURE_FILE;
use loadtest_engine::execution_log::{Action, ExecutionLogReader};
use loadtest_engine::inventory::TestUnit;
use loadtest_engine::runner::{AbortReason, RunState, SUMMARY_FILE};
use loadtest_engine::suite::{SelectionMode, SuiteSettings};
use loadtest_engine::tracker::TestContext;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn slow_pass(_: &TestUnit, _: &TestContext) -> Result<Verdict, TestError> {
    thread::sleep(Duration::from_millis(2));
    Ok(Verdict::Passed)
}

#[test]
fn test_abort_at_failure_limit_stops_all_workers() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new().on("pass", slow_pass).failing("fail");

    let mut settings = settings(dir.path());
    settings.abort_at_failure_limit = 1;
    settings.time_limit = Some(Duration::from_secs(30));

    let threads = 4;
    let suite = suite(
        &["fail", "pass", "pass", "pass"],
        SuiteSettings {
            threads,
            mode: SelectionMode::Sequential,
            ..Default::default()
        },
    );

    let started = Instant::now();
    let summary = runner(settings, vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(20), "run did not stop on the first failure");
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.abort_reason, Some(AbortReason::FailureLimit));
    assert!(summary.failures() >= 1);
    // Workers stop after the test they were running, not after the suite
    assert!(summary.started <= 50, "started {} tests after the limit", summary.started);
    assert_eq!(summary.started, summary.passed + summary.failures());
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn test_first_failure_dump_fires_once() {
    let dir = TempDir::new().unwrap();
    let dumper = Arc::new(CountingDumper::default());
    let adaptor = ScriptedAdaptor::new().failing("a").failing("b");

    let suite = suite(
        &["a", "b"],
        SuiteSettings {
            threads: 8,
            total_tests: Some(200),
            ..Default::default()
        },
    );
    let summary = runner(settings(dir.path()), vec![suite], adaptor.registry())
        .unwrap()
        .with_dumper(dumper.clone())
        .run()
        .unwrap();

    assert_eq!(summary.failed, 200);
    assert_eq!(dumper.count(), 1);
    assert!(summary.first_failure_dumped);
    assert_eq!(summary.state, RunState::Failed);
}

#[test]
fn test_default_dumper_writes_report_file() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new().failing("broken");
    let suite = suite(
        &["broken"],
        SuiteSettings {
            total_tests: Some(3),
            ..Default::default()
        },
    );

    runner(settings(dir.path()), vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    let report = std::fs::read_to_string(dir.path().join(FIRST_FAILURE_FILE)).unwrap();
    assert!(report.contains("test: broken"));
    assert!(report.contains("assertion failed"));
    assert!(dir.path().join(SUMMARY_FILE).exists());
}

#[test]
fn test_errors_and_panics_are_uncaught_failures() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new()
        .on("panics", |_, _| panic!("index out of bounds"))
        .on("errors", |_, _| Err(TestError::Failed("connection refused".to_string())))
        .passing("fine");

    let suite = suite(
        &["panics", "errors", "fine"],
        SuiteSettings {
            mode: SelectionMode::Sequential,
            total_tests: Some(3),
            ..Default::default()
        },
    );
    let summary = runner(settings(dir.path()), vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.uncaught, 2);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.failures(), 2);

    let reader = ExecutionLogReader::open(dir.path()).unwrap();
    let failures: Vec<_> = reader
        .events()
        .unwrap()
        .into_iter()
        .filter(|e| e.is_failure())
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| e.action == Action::FailedThrowable));
    let panic_output = String::from_utf8_lossy(&failures[0].output).into_owned();
    assert!(panic_output.contains("test panicked: index out of bounds"));
    let error_output = String::from_utf8_lossy(&failures[1].output).into_owned();
    assert!(error_output.contains("connection refused"));
}

#[test]
fn test_blocked_exit_classification() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new()
        .on("exit-zero", |_, _| Err(TestError::ExitRequested(0)))
        .on("exit-three", |_, _| Err(TestError::ExitRequested(3)));

    let suite = suite(
        &["exit-zero", "exit-three"],
        SuiteSettings {
            mode: SelectionMode::Sequential,
            total_tests: Some(2),
            ..Default::default()
        },
    );
    let summary = runner(settings(dir.path()), vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        logged(dir.path()).unwrap(),
        vec![
            (Action::Started, "exit-zero".to_string()),
            (Action::BlockedExitPass, "exit-zero".to_string()),
            (Action::Started, "exit-three".to_string()),
            (Action::BlockedExitFail, "exit-three".to_string()),
        ]
    );
}

#[test]
fn test_out_of_memory_aborts_run() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new()
        .on("hog", |_, _| Err(TestError::OutOfMemory("allocation of 8 GiB failed".to_string())));

    let suite = suite(&["hog"], SuiteSettings::default());
    let mut settings = settings(dir.path());
    settings.time_limit = Some(Duration::from_secs(30));
    let summary = runner(settings, vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.abort_reason, Some(AbortReason::OutOfMemory));
    assert_eq!(summary.uncaught, 1);
}

#[test]
fn test_out_of_memory_can_be_an_ordinary_failure() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new()
        .on("hog", |_, _| Err(TestError::OutOfMemory("allocation failed".to_string())));

    let suite = suite(
        &["hog"],
        SuiteSettings {
            total_tests: Some(3),
            ..Default::default()
        },
    );
    let mut settings = settings(dir.path());
    settings.abort_if_out_of_memory = false;
    let summary = runner(settings, vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.uncaught, 3);
    assert_eq!(summary.abort_reason, None);
}

#[test]
fn test_time_limit_stops_unbounded_suite() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new().on("tick", slow_pass);

    let mut settings = settings(dir.path());
    settings.time_limit = Some(Duration::from_millis(300));
    let suite = suite(
        &["tick"],
        SuiteSettings {
            threads: 2,
            ..Default::default()
        },
    );

    let started = Instant::now();
    let summary = runner(settings, vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.state, RunState::Passed);
    assert!(summary.passed > 0);
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn test_external_abort_through_handle() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new().on("tick", slow_pass);
    let suite = suite(
        &["tick"],
        SuiteSettings {
            threads: 2,
            ..Default::default()
        },
    );

    let runner = runner(settings(dir.path()), vec![suite], adaptor.registry()).unwrap();
    let handle = runner.handle();
    let run = thread::spawn(move || runner.run());

    thread::sleep(Duration::from_millis(150));
    assert_eq!(handle.state(), RunState::Running);
    handle.abort();

    let summary = run.join().unwrap().unwrap();
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.abort_reason, Some(AbortReason::External));
    assert_eq!(handle.state(), RunState::Aborted);
    assert_eq!(summary.failures(), 0);
}

#[test]
fn test_output_is_attributed_per_concurrent_test() {
    let dir = TempDir::new().unwrap();
    let adaptor = ScriptedAdaptor::new()
        .on("left", |unit, ctx| {
            let handle = ctx
                .spawn("helper", |ctx| {
                    write!(ctx.stdout(), "left-child").ok();
                })
                .map_err(|e| TestError::Failed(e.to_string()))?;
            handle.join().ok();
            write!(ctx.stdout(), " {}", unit.name()).ok();
            Ok(Verdict::Failed)
        })
        .on("right", |unit, ctx| {
            write!(ctx.stdout(), "right {}", unit.name()).ok();
            Ok(Verdict::Failed)
        });

    let suite = suite(
        &["left", "right"],
        SuiteSettings {
            threads: 4,
            total_tests: Some(40),
            ..Default::default()
        },
    );
    runner(settings(dir.path()), vec![suite], adaptor.registry())
        .unwrap()
        .run()
        .unwrap();

    let reader = ExecutionLogReader::open(dir.path()).unwrap();
    for event in reader.events().unwrap().into_iter().filter(|e| e.is_failure()) {
        let output = String::from_utf8_lossy(&event.output).into_owned();
        match event.test_name.as_deref() {
            Some("left") => assert_eq!(output, "left-child left"),
            Some("right") => assert_eq!(output, "right right"),
            other => panic!("unexpected test {other:?}"),
        }
    }
}
