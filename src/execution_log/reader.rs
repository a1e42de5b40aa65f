//! Offline reader for a results directory.

use bincode::Options;
use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{
    record_codec, segment_number, Action, ExecutionLogError, ExecutionRecord, RunMetadata,
    FORMAT_VERSION, METADATA_FILE,
};

/// A record resolved against the run metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Tz>,
    pub action: Action,
    pub thread_id: u32,
    pub suite_id: u32,
    pub test_id: u32,
    pub test_name: Option<String>,
    pub output: Vec<u8>,
}

impl ExecutionEvent {
    pub fn is_failure(&self) -> bool {
        self.action.is_failure()
    }
}

/// Reads the metadata and surviving segments of an execution log
#[derive(Debug)]
pub struct ExecutionLogReader {
    metadata: RunMetadata,
    timezone: Tz,
    segments: Vec<(u64, PathBuf)>,
}

impl ExecutionLogReader {
    pub fn open(dir: &Path) -> Result<Self, ExecutionLogError> {
        let mut meta = BufReader::new(File::open(dir.join(METADATA_FILE))?);
        let metadata = RunMetadata::read_from(&mut meta)?;
        let timezone: Tz = metadata
            .timezone
            .parse()
            .map_err(|_| ExecutionLogError::UnknownTimezone(metadata.timezone.clone()))?;

        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(number) = segment_number(&entry.file_name().to_string_lossy()) {
                segments.push((number, entry.path()));
            }
        }
        segments.sort_by_key(|(number, _)| *number);

        Ok(Self {
            metadata,
            timezone,
            segments,
        })
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Numbers of the segments still on disk, ascending
    pub fn segments(&self) -> Vec<u64> {
        self.segments.iter().map(|(n, _)| *n).collect()
    }

    pub fn test_name(&self, suite_id: u32, test_id: u32) -> Option<&str> {
        self.metadata.test_name(suite_id, test_id)
    }

    /// Every record of every surviving segment, in order
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            segments: self.segments.iter(),
            current: None,
        }
    }

    /// Resolve a record's absolute time in the recorded timezone
    pub fn timestamp(&self, record: &ExecutionRecord) -> Result<DateTime<Tz>, ExecutionLogError> {
        let millis = self
            .metadata
            .base_timestamp_ms
            .checked_add(record.offset_ms as i64)
            .ok_or(ExecutionLogError::InvalidTimestamp(self.metadata.base_timestamp_ms))?;
        self.timezone
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(ExecutionLogError::InvalidTimestamp(millis))
    }

    pub fn events(&self) -> Result<Vec<ExecutionEvent>, ExecutionLogError> {
        self.records()
            .map(|record| {
                let record = record?;
                Ok(ExecutionEvent {
                    timestamp: self.timestamp(&record)?,
                    action: record.action,
                    thread_id: record.thread_id,
                    suite_id: record.suite_id,
                    test_id: record.test_id,
                    test_name: self.test_name(record.suite_id, record.test_id).map(str::to_string),
                    output: record.output,
                })
            })
            .collect()
    }
}

struct SegmentCursor {
    number: u64,
    reader: BufReader<File>,
}

/// Lazy iterator over the records of all segments.
///
/// A segment cut short by a crash ends at its last complete record.
pub struct RecordIter<'a> {
    segments: std::slice::Iter<'a, (u64, PathBuf)>,
    current: Option<SegmentCursor>,
}

impl RecordIter<'_> {
    fn open_next(&mut self) -> Option<Result<SegmentCursor, ExecutionLogError>> {
        let (number, path) = self.segments.next()?;
        Some(open_segment(*number, path))
    }
}

fn open_segment(number: u64, path: &Path) -> Result<SegmentCursor, ExecutionLogError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|_| ExecutionLogError::Truncated("segment has no header"))?;
    if version[0] != FORMAT_VERSION {
        return Err(ExecutionLogError::UnsupportedVersion(version[0]));
    }
    Ok(SegmentCursor { number, reader })
}

impl Iterator for RecordIter<'_> {
    type Item = Result<ExecutionRecord, ExecutionLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = match self.current.as_mut() {
                Some(cursor) => cursor,
                None => match self.open_next()? {
                    Ok(cursor) => self.current.insert(cursor),
                    Err(e) => return Some(Err(e)),
                },
            };

            let exhausted = match cursor.reader.fill_buf() {
                Ok(buf) => buf.is_empty(),
                Err(e) => return Some(Err(e.into())),
            };
            if exhausted {
                self.current = None;
                continue;
            }

            match record_codec().deserialize_from(&mut cursor.reader) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    let cut_short = matches!(
                        &*e,
                        bincode::ErrorKind::Io(io) if io.kind() == ErrorKind::UnexpectedEof
                    );
                    if !cut_short {
                        return Some(Err(e.into()));
                    }
                    warn!(segment = cursor.number, "execution log segment ends mid-record");
                    self.current = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_log::{segment_path, ExecutionLog, LogLimits, SuiteMetadata, TestName};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn metadata() -> RunMetadata {
        RunMetadata::new(
            "Asia/Tokyo",
            vec![SuiteMetadata {
                suite_id: 0,
                threads: 1,
                inventory: "core".to_string(),
                tests: vec![TestName {
                    id: 3,
                    name: "org.example.A".to_string(),
                }],
            }],
        )
        .with_base_timestamp(1_600_000_000_000)
    }

    #[test]
    fn test_events_resolve_names_and_timezone() {
        let dir = TempDir::new().unwrap();
        let log = ExecutionLog::create(dir.path(), LogLimits::default(), metadata()).unwrap();
        log.append(&ExecutionRecord {
            offset_ms: 1_500,
            action: Action::Started,
            thread_id: 0,
            suite_id: 0,
            test_id: 3,
            output: vec![],
        })
        .unwrap();
        log.close().unwrap();

        let reader = ExecutionLogReader::open(dir.path()).unwrap();
        let events = reader.events().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.test_name.as_deref(), Some("org.example.A"));
        assert_eq!(event.timestamp.timestamp_millis(), 1_600_000_001_500);
        assert_eq!(event.timestamp.timezone(), chrono_tz::Asia::Tokyo);
        assert_eq!(event.timestamp.to_rfc3339(), "2020-09-13T21:26:41.500+09:00");
    }

    #[test]
    fn test_partial_trailing_record_is_ignored() {
        let dir = TempDir::new().unwrap();
        let log = ExecutionLog::create(dir.path(), LogLimits::default(), metadata()).unwrap();
        log.log(Action::Failed, 0, 0, 3, b"a long enough failure message").unwrap();
        log.log(Action::Started, 0, 0, 3, &[]).unwrap();
        log.close().unwrap();

        // Cut the failure record in half, as if the process died mid-write
        let path = segment_path(dir.path(), 1);
        let bytes = fs::read(&path).unwrap();
        let mut file = OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        file.write_all(&bytes[..12]).unwrap();
        drop(file);

        let records: Vec<_> = ExecutionLogReader::open(dir.path())
            .unwrap()
            .records()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_rejects_unknown_segment_version() {
        let dir = TempDir::new().unwrap();
        let log = ExecutionLog::create(dir.path(), LogLimits::default(), metadata()).unwrap();
        log.close().unwrap();
        fs::write(segment_path(dir.path(), 1), [2u8, 0, 0]).unwrap();

        let reader = ExecutionLogReader::open(dir.path()).unwrap();
        let first = reader.records().next().unwrap();
        assert!(matches!(first, Err(ExecutionLogError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_missing_metadata() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ExecutionLogReader::open(dir.path()),
            Err(ExecutionLogError::Io(_))
        ));
    }
}
