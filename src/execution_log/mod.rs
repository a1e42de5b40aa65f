//! # Execution Log
//!
//! Append-only binary history of a run. A metadata file describes the run
//! (base timestamp, timezone, suites and their test names) and numbered
//! segment files hold the records. Each record is flushed as soon as it is
//! written so the history survives the process dying mid-run.
//!
//! Segments are bounded in size. When a segment's budget is spent it is
//! sealed and handed to the [`RetentionManager`], which deletes segments to
//! keep the whole log within its disk budget while keeping the ones that
//! explain the first failure.

pub mod format;
pub mod reader;
pub mod retention;

use bincode::Options;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

pub use format::{RunMetadata, SuiteMetadata, TestName};
pub use reader::{ExecutionEvent, ExecutionLogReader};
pub use retention::{RetentionClass, RetentionManager, SegmentInfo};

use crate::adaptor::Verdict;

pub const METADATA_FILE: &str = "executionlog.meta";
pub const SEGMENT_PREFIX: &str = "executionlog.";
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on a single encoded record
const MAX_RECORD_BYTES: u64 = 16 * 1024 * 1024;

/// Record encoding: bincode varints, big-endian, size-limited
pub(crate) fn record_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_big_endian()
        .with_limit(MAX_RECORD_BYTES)
}

/// What happened to a test at the recorded instant
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::FromRepr,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum Action {
    Started = 1,
    Passed = 2,
    Failed = 3,
    /// Test raised an error or panicked
    FailedThrowable = 4,
    Unknown = 5,
    BlockedExitPass = 6,
    BlockedExitFail = 7,
}

impl Action {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Action::Failed | Action::FailedThrowable | Action::Unknown | Action::BlockedExitFail
        )
    }

    /// Terminal action for a final verdict. No signal at all counts as a pass.
    pub fn from_verdict(verdict: Verdict) -> Action {
        match verdict {
            Verdict::NoResult | Verdict::Passed => Action::Passed,
            Verdict::BlockedExitPass => Action::BlockedExitPass,
            Verdict::Unknown => Action::Unknown,
            Verdict::BlockedExitFail => Action::BlockedExitFail,
            Verdict::Failed => Action::Failed,
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Action::from_repr(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown action code {code}")))
    }
}

/// One entry of the execution history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Milliseconds since the run's base timestamp
    pub offset_ms: u64,
    pub action: Action,
    pub thread_id: u32,
    pub suite_id: u32,
    pub test_id: u32,
    /// Captured output; only failure records carry any
    pub output: Vec<u8>,
}

/// Disk budget of the log, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    pub total_space: u64,
    pub segment_space: u64,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            total_space: 200 * 1024 * 1024,
            segment_space: 2 * 1024 * 1024,
        }
    }
}

/// Execution log errors
#[derive(Debug, Error)]
pub enum ExecutionLogError {
    #[error("execution log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode execution record: {0}")]
    Encode(#[from] bincode::Error),

    #[error("unsupported execution log version {0}")]
    UnsupportedVersion(u8),

    #[error("execution log is truncated: {0}")]
    Truncated(&'static str),

    #[error("{field} too long to record ({len})")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("unknown timezone '{0}' in execution log metadata")]
    UnknownTimezone(String),

    #[error("timestamp {0} ms is out of range")]
    InvalidTimestamp(i64),

    #[error("execution log is closed")]
    Closed,
}

struct ActiveSegment {
    number: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    remaining: i64,
    has_failure: bool,
}

struct LogState {
    active: Option<ActiveSegment>,
    next_segment: u64,
    retention: RetentionManager,
    records: u64,
    closed: bool,
}

/// Shared, thread-safe execution log writer
pub struct ExecutionLog {
    dir: PathBuf,
    limits: LogLimits,
    metadata: RunMetadata,
    base: Instant,
    state: Mutex<LogState>,
}

impl ExecutionLog {
    /// Create the log in `dir`, replacing any log files from an earlier run,
    /// and write the metadata file.
    ///
    /// Record offsets count from the moment this is called.
    pub fn create(dir: &Path, limits: LogLimits, metadata: RunMetadata) -> Result<Self, ExecutionLogError> {
        Self::create_at(dir, limits, metadata, Instant::now())
    }

    /// Like [`create`](Self::create), with offsets counted from `base`.
    ///
    /// `base` must be read at the same moment as the metadata's
    /// `base_timestamp_ms` for `base + offset` to give wall-clock times.
    pub fn create_at(
        dir: &Path,
        limits: LogLimits,
        metadata: RunMetadata,
        base: Instant,
    ) -> Result<Self, ExecutionLogError> {
        fs::create_dir_all(dir)?;
        remove_stale_files(dir)?;

        let mut writer = BufWriter::new(File::create(dir.join(METADATA_FILE))?);
        metadata.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        info!(
            dir = %dir.display(),
            total_space = limits.total_space,
            segment_space = limits.segment_space,
            "execution log created"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            limits,
            metadata,
            base,
            state: Mutex::new(LogState {
                active: None,
                next_segment: 1,
                retention: RetentionManager::new(limits.total_space, limits.segment_space),
                records: 0,
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn limits(&self) -> LogLimits {
        self.limits
    }

    /// Milliseconds since the log was created
    pub fn elapsed_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// Append one record. Output is dropped for non-failure actions.
    ///
    /// The offset is taken under the log lock, so offsets never decrease
    /// in file order.
    pub fn log(
        &self,
        action: Action,
        thread_id: u32,
        suite_id: u32,
        test_id: u32,
        output: &[u8],
    ) -> Result<(), ExecutionLogError> {
        let mut state = self.state.lock();
        let record = ExecutionRecord {
            offset_ms: self.elapsed_ms(),
            action,
            thread_id,
            suite_id,
            test_id,
            output: if action.is_failure() {
                output.to_vec()
            } else {
                Vec::new()
            },
        };
        self.write_record(&mut state, &record)
    }

    /// Append a prepared record
    pub fn append(&self, record: &ExecutionRecord) -> Result<(), ExecutionLogError> {
        let mut state = self.state.lock();
        self.write_record(&mut state, record)
    }

    fn write_record(&self, state: &mut LogState, record: &ExecutionRecord) -> Result<(), ExecutionLogError> {
        if state.closed {
            return Err(ExecutionLogError::Closed);
        }
        let bytes = record_codec().serialize(record)?;
        if state.active.is_none() {
            let segment = self.open_segment(state.next_segment)?;
            state.next_segment += 1;
            state.active = Some(segment);
        }

        let seal = match state.active.as_mut() {
            Some(segment) => {
                segment.writer.write_all(&bytes)?;
                segment.writer.flush()?;
                segment.remaining -= bytes.len() as i64;
                segment.has_failure |= record.action.is_failure();
                segment.remaining < 0
            }
            None => false,
        };
        state.records += 1;

        if seal {
            self.seal(state, true)?;
        }
        Ok(())
    }

    fn open_segment(&self, number: u64) -> Result<ActiveSegment, ExecutionLogError> {
        let path = segment_path(&self.dir, number);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&[FORMAT_VERSION])?;
        writer.flush()?;
        debug!(segment = number, path = %path.display(), "opened execution log segment");
        Ok(ActiveSegment {
            number,
            path,
            writer,
            remaining: self.limits.segment_space as i64 - 1,
            has_failure: false,
        })
    }

    fn seal(&self, state: &mut LogState, reserve_active: bool) -> Result<(), ExecutionLogError> {
        if let Some(mut segment) = state.active.take() {
            segment.writer.flush()?;
            debug!(
                segment = segment.number,
                has_failure = segment.has_failure,
                "sealed execution log segment"
            );
            state.retention.register(SegmentInfo {
                number: segment.number,
                path: segment.path,
                has_failure: segment.has_failure,
            });
        }
        state.retention.enforce(reserve_active);
        Ok(())
    }

    /// Seal the active segment and apply the final retention pass.
    /// Later appends fail with [`ExecutionLogError::Closed`].
    pub fn close(&self) -> Result<(), ExecutionLogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.seal(&mut state, false)?;
        info!(
            records = state.records,
            segments = state.next_segment - 1,
            retained = state.retention.retained().len(),
            "execution log closed"
        );
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.state.lock().records
    }

    /// Number of segments opened so far, including deleted ones
    pub fn segments_opened(&self) -> u64 {
        self.state.lock().next_segment - 1
    }
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("dir", &self.dir)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{number}"))
}

/// Segment number encoded in a file name, if it is a segment file
pub fn segment_number(file_name: &str) -> Option<u64> {
    file_name.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

fn remove_stale_files(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == METADATA_FILE || segment_number(&name).is_some() {
            debug!(file = %name, "removing execution log file from an earlier run");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
