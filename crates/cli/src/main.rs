//! Command-line entry point: loads a configuration file, brings the declared
//! services up and watches them until interrupted.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use keel_bootable::Registry;
use keel_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Orchestrator error
    #[error(transparent)]
    Orchestrator(#[from] keel_orchestrator::Error),

    /// Signal handler could not be installed
    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the orchestrator configuration file
    #[arg(long, default_value = "keel.json", env = "KEEL_CONFIG")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set
    #[arg(long, default_value = "info", env = "KEEL_LOG")]
    log_level: String,

    /// Validate the configuration and dependency graph, then exit
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Error> {
    info!("loading configuration from {:?}", args.config);
    let config = OrchestratorConfig::from_file(&args.config)?;
    let orchestrator = Orchestrator::new(config, Registry::new())?;

    if args.validate_only {
        let order = orchestrator
            .graph()
            .topological_order()
            .map_err(keel_orchestrator::Error::from)?;
        info!("configuration valid, start order: [{}]", order.join(", "));
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = CancellationToken::new();
    let mut signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let start = orchestrator.start();
    tokio::pin!(start);
    let report = tokio::select! {
        report = &mut start => report?,
        () = shutdown.cancelled() => {
            orchestrator.cancel_startup();
            start.await?
        }
    };

    if !report.is_operational() {
        error!("startup did not complete ({:?})", report.health);
        orchestrator.shutdown().await;
        return Ok(ExitCode::from(1));
    }

    let mut state = orchestrator.subscribe();
    let outcome = tokio::select! {
        () = shutdown.cancelled() => None,
        result = &mut signals => {
            result.map_err(|e| std::io::Error::other(e.to_string()))??;
            None
        }
        changed = state.wait_for(|s| s.is_terminal()) => changed.ok().map(|s| *s),
    };

    let code = match outcome {
        Some(OrchestratorState::ManualInterventionRequired) => {
            error!("rollback exhausted every strategy, manual intervention required");
            ExitCode::from(2)
        }
        Some(other) => {
            warn!("orchestrator entered {:?}", other);
            ExitCode::from(1)
        }
        None => ExitCode::SUCCESS,
    };

    orchestrator.shutdown().await;
    Ok(code)
}

#[cfg(unix)]
async fn wait_for_signal(shutdown: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    shutdown.cancel();
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: CancellationToken) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received interrupt signal");
    shutdown.cancel();
    Ok(())
}
