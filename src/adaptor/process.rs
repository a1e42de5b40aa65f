//! Adaptor that runs `command` test units as child processes.
//!
//! A test that exits only ends its own process. Status 0 is a pass and any
//! other status a failure; blocked-exit verdicts are left to in-process
//! adaptors.

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use tracing::debug;

use super::{MarkerScanner, TestAdaptor, TestError, Verdict};
use crate::inventory::TestUnit;
use crate::tracker::TestContext;

const PUMP_BUFFER: usize = 8 * 1024;

/// Runs each test unit's `command` and maps its exit status to a verdict
#[derive(Debug, Clone, Default)]
pub struct ProcessAdaptor {
    scanner: MarkerScanner,
}

impl ProcessAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also scan the child's output with `scanner`
    pub fn with_scanner(scanner: MarkerScanner) -> Self {
        Self { scanner }
    }
}

/// Copy a child stream into an intercepted writer until EOF
fn pump<R: Read, W: Write>(mut from: R, mut to: W) -> io::Result<()> {
    let mut buf = [0u8; PUMP_BUFFER];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            return to.flush();
        }
        to.write_all(&buf[..n])?;
    }
}

/// Kill and reap a child that is being abandoned, then hand back `err`
fn abandon(child: &mut Child, err: TestError) -> TestError {
    if let Err(e) = child.kill() {
        debug!(error = %e, pid = child.id(), "kill failed; child may have exited");
    }
    if let Err(e) = child.wait() {
        debug!(error = %e, pid = child.id(), "cannot reap abandoned child");
    }
    err
}

impl TestAdaptor for ProcessAdaptor {
    fn execute(&self, unit: &TestUnit, ctx: &TestContext) -> Result<Verdict, TestError> {
        let (program, args) = unit
            .command()
            .split_first()
            .ok_or_else(|| TestError::Failed(format!("{} has no command to run", unit.name())))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TestError::Failed(format!("cannot start {program}: {e}")))?;

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            match ctx.spawn("pump-stdout", move |ctx| pump(stdout, ctx.stdout())) {
                Ok(handle) => pumps.push(handle),
                Err(e) => return Err(abandon(&mut child, TestError::Failed(e.to_string()))),
            }
        }
        if let Some(stderr) = child.stderr.take() {
            match ctx.spawn("pump-stderr", move |ctx| pump(stderr, ctx.stderr())) {
                Ok(handle) => pumps.push(handle),
                Err(e) => return Err(abandon(&mut child, TestError::Failed(e.to_string()))),
            }
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                let err = TestError::Failed(format!("waiting for {program}: {e}"));
                return Err(abandon(&mut child, err));
            }
        };

        for pump in pumps {
            match pump.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, test = %unit.name(), "output pump stopped early"),
                Err(_) => debug!(test = %unit.name(), "output pump panicked"),
            }
        }

        match status.code() {
            Some(0) => Ok(Verdict::Passed),
            Some(_) => Ok(Verdict::Failed),
            None => Err(TestError::Failed(format!("{program} was terminated by a signal"))),
        }
    }

    fn check_output(&self, output: &[u8]) -> Verdict {
        self.scanner.scan(output)
    }
}
