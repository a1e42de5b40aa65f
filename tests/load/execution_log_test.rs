//! Execution log files written and read back from disk.

use loadtest_engine::execution_log::{
    segment_path, Action, ExecutionLog, ExecutionLogReader, LogLimits, RunMetadata, SuiteMetadata,
    TestName, METADATA_FILE,
};
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn metadata(tests: u32) -> RunMetadata {
    RunMetadata::new(
        "America/New_York",
        vec![SuiteMetadata {
            suite_id: 0,
            threads: 4,
            inventory: "inventories/core.toml".to_string(),
            tests: (0..tests)
                .map(|id| TestName {
                    id,
                    name: format!("org.example.Test{id}"),
                })
                .collect(),
        }],
    )
}

#[test]
fn test_round_trip_across_segments() {
    let dir = TempDir::new().unwrap();
    let limits = LogLimits {
        total_space: 1024 * 1024,
        segment_space: 128,
    };
    let log = Arc::new(ExecutionLog::create(dir.path(), limits, metadata(10)).unwrap());

    let writers: Vec<_> = (0..4u32)
        .map(|thread_id| {
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..50u32 {
                    let test_id = (thread_id * 50 + i) % 10;
                    log.log(Action::Started, thread_id, 0, test_id, &[]).unwrap();
                    let action = if i == 25 { Action::Failed } else { Action::Passed };
                    log.log(action, thread_id, 0, test_id, b"stack trace").unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    log.close().unwrap();
    assert!(log.segments_opened() > 1);

    let reader = ExecutionLogReader::open(dir.path()).unwrap();
    assert_eq!(reader.segments().len() as u64, log.segments_opened());
    assert_eq!(reader.metadata().timezone, "America/New_York");

    let events = reader.events().unwrap();
    assert_eq!(events.len(), 400);
    assert_eq!(events.iter().filter(|e| e.is_failure()).count(), 4);

    let base = reader.metadata().base_timestamp_ms;
    let mut previous = base;
    for event in &events {
        let millis = event.timestamp.timestamp_millis();
        assert!(millis >= previous, "timestamps go backwards");
        previous = millis;
        assert_eq!(
            event.test_name.as_deref(),
            Some(format!("org.example.Test{}", event.test_id).as_str())
        );
        if event.is_failure() {
            assert_eq!(event.output, b"stack trace");
        } else {
            assert!(event.output.is_empty());
        }
    }
}

#[test]
fn test_retention_keeps_first_failure_chain_and_latest() {
    let dir = TempDir::new().unwrap();
    // Each record below is 6 bytes, so a 32 byte segment seals after 6 records
    let limits = LogLimits {
        total_space: 32 * 6,
        segment_space: 32,
    };
    let log = ExecutionLog::create(dir.path(), limits, metadata(1)).unwrap();

    for segment in 1..=12u64 {
        for record in 0..6 {
            let action = if segment == 3 && record == 2 {
                Action::Failed
            } else {
                Action::Started
            };
            log.log(action, 0, 0, 0, &[]).unwrap();
        }
    }
    log.close().unwrap();
    assert_eq!(log.segments_opened(), 12);

    let reader = ExecutionLogReader::open(dir.path()).unwrap();
    // One slot stays reserved for the active segment until the log closes
    assert_eq!(reader.segments(), vec![1, 2, 3, 11, 12]);
    assert!(dir.path().join(METADATA_FILE).exists());
    assert!(!segment_path(dir.path(), 4).exists());

    let failures = reader.events().unwrap().into_iter().filter(|e| e.is_failure()).count();
    assert_eq!(failures, 1);
}
