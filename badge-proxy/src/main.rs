mod config;
mod telemetry;

use clap::Parser;
use config::Cli;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = telemetry::init_sentry(&config.common.logging);
    if let Err(e) = telemetry::init_logging(&config.common.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    if let Some(metrics) = &config.common.metrics
        && let Err(e) = telemetry::init_metrics(metrics)
    {
        tracing::error!(error = %e, "Failed to initialize metrics");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(proxy::run(config.proxy)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Badge proxy stopped");
            ExitCode::FAILURE
        }
    }
}
