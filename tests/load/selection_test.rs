//! Test selection observed through complete runs.

use super::common::{logged, runner, settings, ScriptedAdaptor};
use loadtest_engine::adaptor::{AdaptorRegistry, ProcessAdaptor};
use loadtest_engine::config::Config;
use loadtest_engine::execution_log::{Action, ExecutionLogReader};
use loadtest_engine::inventory::{AdaptorKind, IdAllocator, Inventory};
use loadtest_engine::runner::{LoadTestRunner, RunState};
use loadtest_engine::suite::{SelectionMode, Suite, SuiteSettings};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_inventory(dir: &Path, name: &str, entries: &[(&str, &str)]) -> std::path::PathBuf {
    let body: String = entries
        .iter()
        .map(|(class, weight)| {
            format!("[[entry]]\nkind = \"junit\"\nclass = \"{class}\"\nweighting = \"{weight}\"\n\n")
        })
        .collect();
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn started_names(dir: &Path) -> Vec<String> {
    logged(dir)
        .unwrap()
        .into_iter()
        .filter(|(action, _)| *action == Action::Started)
        .map(|(_, name)| name)
        .collect()
}

#[test]
fn test_sequential_repeats_with_bound() {
    let inputs = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let path = write_inventory(inputs.path(), "ab.toml", &[("A", "1"), ("B", "1")]);

    let inventory = Inventory::load(&path, &[], &IdAllocator::new()).unwrap();
    let suite = Suite::new(
        0,
        inventory,
        SuiteSettings {
            mode: SelectionMode::Sequential,
            repeat_count: 2,
            total_tests: Some(6),
            ..Default::default()
        },
    )
    .unwrap();

    let summary = runner(settings(results.path()), vec![suite], ScriptedAdaptor::new().registry())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.started, 6);
    assert_eq!(started_names(results.path()), vec!["A", "A", "B", "B", "A", "A"]);
}

#[test]
fn test_weighted_table_drives_random_selection() {
    let inputs = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let path = write_inventory(
        inputs.path(),
        "weighted.toml",
        &[("A", "1"), ("B", "0.5"), ("C", "1.25")],
    );

    let inventory = Inventory::load(&path, &[], &IdAllocator::new()).unwrap();
    let suite = Suite::new(
        0,
        inventory,
        SuiteSettings {
            seed: Some(99),
            total_tests: Some(2_200),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(suite.table().multiplier(), 4);
    assert_eq!(suite.table().len(), 11);

    let summary = runner(settings(results.path()), vec![suite], ScriptedAdaptor::new().registry())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.suites[0].multiplier, 4);
    assert_eq!(summary.suites[0].seed, 99);

    let names = started_names(results.path());
    let count = |n: &str| names.iter().filter(|x| x.as_str() == n).count();
    // Expected shares 4/11, 2/11 and 5/11 of 2200
    assert!((650..950).contains(&count("A")), "A ran {} times", count("A"));
    assert!((280..520).contains(&count("B")), "B ran {} times", count("B"));
    assert!((850..1150).contains(&count("C")), "C ran {} times", count("C"));
}

#[test]
fn test_ids_are_unique_across_suites() {
    let inputs = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let path = write_inventory(inputs.path(), "shared.toml", &[("A", "1"), ("B", "1")]);

    let ids = IdAllocator::new();
    let first = Inventory::load(&path, &[], &ids).unwrap();
    let second = Inventory::load(&path, &[], &ids).unwrap();
    let suites = vec![
        Suite::new(
            0,
            first,
            SuiteSettings {
                total_tests: Some(10),
                ..Default::default()
            },
        )
        .unwrap(),
        Suite::new(
            1,
            second,
            SuiteSettings {
                threads: 2,
                total_tests: Some(10),
                ..Default::default()
            },
        )
        .unwrap(),
    ];

    let summary = runner(settings(results.path()), suites, ScriptedAdaptor::new().registry())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.started, 20);

    let reader = ExecutionLogReader::open(results.path()).unwrap();
    let meta = reader.metadata();
    let mut all_ids: Vec<u32> = meta
        .suites
        .iter()
        .flat_map(|s| s.tests.iter().map(|t| t.id))
        .collect();
    all_ids.sort_unstable();
    assert_eq!(all_ids, vec![0, 1, 2, 3]);
    assert_eq!(meta.suites[1].threads, 2);
    assert!(reader.events().unwrap().iter().all(|e| e.test_name.is_some()));
}

#[cfg(unix)]
#[test]
fn test_config_driven_run_with_process_adaptor() {
    let inputs = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let inventory = inputs.path().join("commands.toml");
    fs::write(
        &inventory,
        r#"
        [[entry]]
        kind = "command"
        class = "ok"
        command = ["sh", "-c", "echo fine"]

        [[entry]]
        kind = "command"
        class = "broken"
        command = ["sh", "-c", "echo bad >&2; exit 4"]
        "#,
    )
    .unwrap();
    let exclude = inputs.path().join("skip.toml");
    fs::write(&exclude, "[[entry]]\nkind = \"command\"\nclass = \"broken\"\ncommand = [\"true\"]\n").unwrap();

    let config = Config::from_toml_str(&format!(
        r#"
        [run]
        results_dir = "{results}"
        report_interval = "100ms"

        [[suites]]
        inventory = "{inventory}"
        threads = 2
        total_tests = 6
        selection = "sequential"

        [[suites]]
        inventory = "{inventory}"
        exclude = ["{exclude}"]
        total_tests = 3
        "#,
        results = results.path().display(),
        inventory = inventory.display(),
        exclude = exclude.display(),
    ))
    .unwrap();

    let registry = AdaptorRegistry::new().with(AdaptorKind::Command, Arc::new(ProcessAdaptor::new()));
    let summary = LoadTestRunner::from_config(&config, registry)
        .unwrap()
        .with_interceptor(Arc::new(loadtest_engine::interceptor::OutputInterceptor::discarding()))
        .run()
        .unwrap();

    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.started, 9);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.passed, 6);

    let failures: Vec<_> = ExecutionLogReader::open(results.path())
        .unwrap()
        .events()
        .unwrap()
        .into_iter()
        .filter(|e| e.is_failure())
        .collect();
    assert_eq!(failures.len(), 3);
    for event in failures {
        assert_eq!(event.suite_id, 0);
        assert_eq!(event.test_name.as_deref(), Some("broken"));
        assert_eq!(String::from_utf8_lossy(&event.output).trim(), "bad");
    }
}
