use anyhow::{Context, Result};
use loadtest_engine::adaptor::{AdaptorRegistry, ProcessAdaptor};
use loadtest_engine::config::Config;
use loadtest_engine::inventory::AdaptorKind;
use loadtest_engine::runner::{LoadTestRunner, RunSummary};
use loadtest_engine::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const SETUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            let _guard = telemetry::init_tracing(None);
            error!(error = %e, "invalid configuration");
            return ExitCode::from(SETUP_FAILURE);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.run.results_dir) {
        let _guard = telemetry::init_tracing(None);
        error!(error = %e, dir = %cfg.run.results_dir.display(), "cannot create results directory");
        return ExitCode::from(SETUP_FAILURE);
    }
    let _guard = telemetry::init_tracing(Some(&cfg.run.results_dir));

    match run(cfg).await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(e) => {
            error!(error = format!("{e:#}"), "load test could not start");
            ExitCode::from(SETUP_FAILURE)
        }
    }
}

async fn run(cfg: Config) -> Result<RunSummary> {
    let registry = AdaptorRegistry::new().with(AdaptorKind::Command, Arc::new(ProcessAdaptor::new()));
    let runner = LoadTestRunner::from_config(&cfg, registry).context("preparing load test")?;
    let handle = runner.handle();

    info!(suites = runner.suites().len(), "starting load test");
    let mut task = tokio::task::spawn_blocking(move || runner.run());

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = telemetry::shutdown_signal() => {
            warn!("abort requested; waiting for running tests to finish");
            handle.abort();
            task.await
        }
    };

    let summary = joined.context("runner task failed")??;
    Ok(summary)
}
