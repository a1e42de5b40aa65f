use chrono::Utc;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

use super::{AbortReason, RunShared};
use crate::adaptor::{AdaptorRegistry, TestError, Verdict};
use crate::diagnostics::{FailureReport, FirstFailureDump};
use crate::execution_log::Action;
use crate::suite::{Suite, ThinkTime};
use crate::tracker::{TestCompletion, TestContext};

/// Failure handling knobs shared by every worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct FailurePolicy {
    pub report_failure_limit: u32,
    pub abort_at_failure_limit: u64,
    pub abort_if_out_of_memory: bool,
}

pub(crate) struct Worker {
    pub name: String,
    pub suite: Arc<Suite>,
    pub context: TestContext,
    pub registry: AdaptorRegistry,
    pub shared: Arc<RunShared>,
    pub dump: Arc<FirstFailureDump>,
    pub policy: FailurePolicy,
    pub deadline: Option<Instant>,
}

impl Worker {
    pub(crate) fn run(self) {
        let mut think = ThinkTime::for_thread(&self.name, self.suite.think_time());
        debug!(worker = %self.name, "worker started");

        loop {
            if self.should_stop() {
                break;
            }
            let Some(unit) = self.suite.next_test() else {
                break;
            };
            let Some(adaptor) = self.registry.get(unit.kind()) else {
                self.internal_error(&format!("no adaptor registered for {}", unit.kind()));
                continue;
            };

            self.shared.counters.started.fetch_add(1, super::ORDER);
            let tracker = self.context.tracker();
            if let Err(e) = tracker.start_test(unit.clone(), adaptor.clone()) {
                self.internal_error(&e.to_string());
            }

            let mut out_of_memory = false;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| adaptor.execute(&unit, &self.context)));
            let completion = match outcome {
                Ok(Ok(verdict)) => tracker.finish_test(verdict),
                Ok(Err(TestError::ExitRequested(code))) => {
                    let verdict = if code == 0 {
                        Verdict::BlockedExitPass
                    } else {
                        Verdict::BlockedExitFail
                    };
                    tracker.finish_test(verdict)
                }
                Ok(Err(err @ TestError::OutOfMemory(_))) => {
                    out_of_memory = true;
                    tracker.finish_with_error(&err.to_string())
                }
                Ok(Err(err @ TestError::Failed(_))) => tracker.finish_with_error(&err.to_string()),
                Err(payload) => {
                    tracker.finish_with_error(&format!("test panicked: {}", panic_message(&*payload)))
                }
            };

            if let Some(e) = &completion.log_error {
                self.internal_error(&e.to_string());
            }
            self.record(&completion);

            if out_of_memory && self.policy.abort_if_out_of_memory {
                self.shared.request_abort(AbortReason::OutOfMemory);
            }

            if !self.should_stop() {
                if let Some(delay) = think.next_delay() {
                    thread::sleep(delay);
                }
            }
        }

        debug!(worker = %self.name, "worker finished");
    }

    fn should_stop(&self) -> bool {
        self.shared.is_aborted() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn internal_error(&self, message: &str) {
        self.shared.counters.internal_errors.fetch_add(1, super::ORDER);
        error!(worker = %self.name, error = message, "internal error");
    }

    fn record(&self, completion: &TestCompletion) {
        let counters = &self.shared.counters;
        if completion.passed {
            counters.passed.fetch_add(1, super::ORDER);
            return;
        }
        if completion.action == Action::FailedThrowable {
            counters.uncaught.fetch_add(1, super::ORDER);
        } else {
            counters.failed.fetch_add(1, super::ORDER);
        }
        let ordinal = counters.failures.fetch_add(1, super::ORDER) + 1;

        let Some(unit) = &completion.test else {
            return;
        };
        let report = FailureReport {
            suite_id: self.suite.id(),
            thread: self.name.clone(),
            test_id: unit.id(),
            test_name: unit.name(),
            action: completion.action,
            message: None,
            output: completion.output.clone(),
            at: Utc::now(),
        };

        if ordinal <= u64::from(self.policy.report_failure_limit) {
            error!(
                worker = %self.name,
                suite = report.suite_id,
                test = %report.test_name,
                action = %report.action,
                verdict = %completion.verdict,
                output = %report.output_text(),
                "test failed"
            );
        }

        self.dump.on_failure(&report);

        let limit = self.policy.abort_at_failure_limit;
        if limit > 0 && ordinal >= limit {
            self.shared.request_abort(AbortReason::FailureLimit);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
