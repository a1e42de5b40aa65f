//! # Test Adaptors
//!
//! The engine does not know how to run a test itself. An adaptor takes a
//! [`TestUnit`], runs it with an explicit [`TestContext`] for its output, and
//! returns a [`Verdict`]. Adaptors may also scan intercepted output for pass or
//! fail markers.

pub mod process;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::inventory::{AdaptorKind, TestUnit};
use crate::tracker::TestContext;

pub use process::ProcessAdaptor;

/// Outcome signal of a test, ordered by precedence.
///
/// Combining two verdicts keeps the more severe one, so a verdict can only
/// move toward failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, strum::Display,
)]
pub enum Verdict {
    /// No signal observed
    #[default]
    NoResult,
    Passed,
    /// Test tried to exit the process with status zero
    BlockedExitPass,
    Unknown,
    /// Test tried to exit the process with a non-zero status
    BlockedExitFail,
    Failed,
}

impl Verdict {
    pub fn combine(self, other: Verdict) -> Verdict {
        self.max(other)
    }

    /// Combine a sequence of signals in arrival order
    pub fn resolve(signals: impl IntoIterator<Item = Verdict>) -> Verdict {
        signals.into_iter().fold(Verdict::NoResult, Verdict::combine)
    }

    pub fn is_pass(self) -> bool {
        matches!(self, Verdict::NoResult | Verdict::Passed | Verdict::BlockedExitPass)
    }
}

/// Errors a test can raise instead of returning a verdict
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestError {
    #[error("test raised an error: {0}")]
    Failed(String),

    #[error("test ran out of memory: {0}")]
    OutOfMemory(String),

    /// The test tried to terminate the process; the exit was blocked
    #[error("test attempted to exit with status {0}")]
    ExitRequested(i32),
}

/// Capability to run one family of test units
#[cfg_attr(test, mockall::automock)]
pub trait TestAdaptor: Send + Sync {
    /// Run the test. Output must go through `ctx` so it is attributed to this test.
    fn execute(&self, unit: &TestUnit, ctx: &TestContext) -> Result<Verdict, TestError>;

    /// Scan a chunk of intercepted output for pass/fail markers
    fn check_output(&self, _output: &[u8]) -> Verdict {
        Verdict::NoResult
    }
}

/// Pass/fail marker scanner for adaptors whose tests report through their output
#[derive(Debug, Clone, Default)]
pub struct MarkerScanner {
    pass: Vec<String>,
    fail: Vec<String>,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass_marker(mut self, marker: impl Into<String>) -> Self {
        self.pass.push(marker.into());
        self
    }

    pub fn fail_marker(mut self, marker: impl Into<String>) -> Self {
        self.fail.push(marker.into());
        self
    }

    pub fn scan(&self, output: &[u8]) -> Verdict {
        if self.pass.is_empty() && self.fail.is_empty() {
            return Verdict::NoResult;
        }
        let text = String::from_utf8_lossy(output);
        if self.fail.iter().any(|m| text.contains(m.as_str())) {
            Verdict::Failed
        } else if self.pass.iter().any(|m| text.contains(m.as_str())) {
            Verdict::Passed
        } else {
            Verdict::NoResult
        }
    }
}

/// Adaptors available to a run, keyed by adaptor kind
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<AdaptorKind, Arc<dyn TestAdaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: AdaptorKind, adaptor: Arc<dyn TestAdaptor>) -> &mut Self {
        self.adaptors.insert(kind, adaptor);
        self
    }

    pub fn with(mut self, kind: AdaptorKind, adaptor: Arc<dyn TestAdaptor>) -> Self {
        self.register(kind, adaptor);
        self
    }

    pub fn get(&self, kind: AdaptorKind) -> Option<Arc<dyn TestAdaptor>> {
        self.adaptors.get(&kind).cloned()
    }

    pub fn supports(&self, kind: AdaptorKind) -> bool {
        self.adaptors.contains_key(&kind)
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adaptors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("AdaptorRegistry").field("kinds", &kinds).finish()
    }
}
