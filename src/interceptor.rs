//! Output routing between running tests and the real process streams.
//!
//! The interceptor is the one place that owns stdout and stderr for a run.
//! Writers handed to tests send their bytes to the test's tracker while the
//! test is active; anything else passes through to the real stream.

use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tracker::ExecutionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Byte counters of an interceptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptorStats {
    pub captured_bytes: u64,
    pub passthrough_bytes: u64,
}

type Sink = Mutex<Box<dyn Write + Send>>;

pub struct OutputInterceptor {
    stdout: Sink,
    stderr: Sink,
    captured: AtomicU64,
    passthrough: AtomicU64,
}

impl OutputInterceptor {
    pub fn new(stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        Self {
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            captured: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
        }
    }

    /// Interceptor over the process's own stdout and stderr
    pub fn process() -> Self {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Interceptor whose pass-through output is thrown away
    pub fn discarding() -> Self {
        Self::new(Box::new(io::sink()), Box::new(io::sink()))
    }

    /// Send `bytes` to the tracker's active test, or to the real stream
    pub fn route(
        &self,
        kind: StreamKind,
        tracker: Option<&ExecutionTracker>,
        bytes: &[u8],
    ) -> io::Result<()> {
        if let Some(tracker) = tracker {
            if tracker.capture(bytes) {
                self.captured.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                return Ok(());
            }
        }
        self.passthrough.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.sink(kind).lock().write_all(bytes)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.stdout.lock().flush()?;
        self.stderr.lock().flush()
    }

    fn sink(&self, kind: StreamKind) -> &Sink {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Writer that routes through this interceptor on behalf of `tracker`
    pub fn writer(
        self: &Arc<Self>,
        kind: StreamKind,
        tracker: Option<Arc<ExecutionTracker>>,
    ) -> InterceptedWriter {
        InterceptedWriter {
            interceptor: Arc::clone(self),
            tracker,
            kind,
        }
    }

    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            captured_bytes: self.captured.load(Ordering::Relaxed),
            passthrough_bytes: self.passthrough.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for OutputInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputInterceptor")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// `Write` handle given to test code
pub struct InterceptedWriter {
    interceptor: Arc<OutputInterceptor>,
    tracker: Option<Arc<ExecutionTracker>>,
    kind: StreamKind,
}

impl InterceptedWriter {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }
}

impl Write for InterceptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.interceptor
            .route(self.kind, self.tracker.as_deref(), buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.interceptor.sink(self.kind).lock().flush()
    }
}
