mod cli;
mod config;
mod error;

use std::process;
use std::sync::Arc;

use clap::Parser;
use process_utils::SystemRunner;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use veilrip_engine::{PipelineCoordinator, RandomPortSelector, RunOutcome};

use crate::{
    cli::Args,
    config::{AppConfig, LogFormat},
    error::{AppError, Result},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(RunOutcome::Completed { output, title }) => {
            info!(title = %title, output = %output.display(), "Done");
        }
        Ok(RunOutcome::Cancelled) => info!("Exited gracefully"),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<RunOutcome> {
    let app_config = AppConfig::load(args.config.as_deref())?;
    init_logging(args.verbose, args.quiet, app_config.logging.format)?;

    let mut config = app_config.engine;
    args.apply_overrides(&mut config);
    config.validate()?;

    let token = CancellationToken::new();
    spawn_signal_listener(token.clone());

    let runner = Arc::new(SystemRunner::with_grace_period(
        config.circuit.stop_grace_period(),
    ));
    let ports = Arc::new(RandomPortSelector::new(config.circuit.port_range()));
    let coordinator = PipelineCoordinator::new(config, runner, ports);

    info!(identifier = %args.identifier, "Starting");
    let outcome = coordinator.run(&args.identifier, &token).await?;
    Ok(outcome)
}

fn init_logging(verbose: bool, quiet: bool, format: LogFormat) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_level(verbose))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Cancelling");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
