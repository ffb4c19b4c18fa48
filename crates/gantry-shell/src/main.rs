//! gantry: application shell that keeps itself up to date.

mod host;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gantry_updater::{
    run_supervised, AppHost, RunOutcome, Supervised, Trigger, UpdateConfig, UpdateOrchestrator,
};

use crate::host::{default_config_path, default_data_dir, TerminalHost};

/// Time allowed for an in-flight run to finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Gantry application shell with automatic updates")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the downloaded package and update state
    #[arg(long, env = "GANTRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Version reported as the running one
    #[arg(long, env = "GANTRY_APP_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    app_version: String,

    /// Run a single manual check and exit
    #[arg(long)]
    once: bool,

    /// Print lifecycle events to stdout as JSON lines
    #[arg(long)]
    json_events: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<UpdateConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| default_config_path().filter(|p| p.is_file()));

    match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            UpdateConfig::load_from_file(&path)
                .with_context(|| format!("failed to load configuration from {:?}", path))
        }
        None => {
            info!("No configuration file, using GANTRY_* environment variables");
            let config = UpdateConfig::load_from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

fn spawn_event_printer(orchestrator: &UpdateOrchestrator) {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(missed)) => warn!("Event printer lagged, {} events lost", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Wait up to `grace` for the update run to wind down.
///
/// Returns `false` when the run is still active, e.g. parked on a blocking
/// consent prompt.
async fn wait_for_run<F: Future>(run: F, grace: Duration) -> bool {
    tokio::time::timeout(grace, run).await.is_ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gantry={},gantry_updater={}",
            args.log_level, args.log_level
        ))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting gantry {}", args.app_version);

    let config = load_config(&args)?;
    let data_dir = args
        .data_dir
        .clone()
        .or_else(default_data_dir)
        .context("cannot determine a data directory; pass --data-dir")?;

    let host: Arc<dyn AppHost> = Arc::new(TerminalHost::new(
        args.app_version.clone(),
        data_dir,
        config.install_dir.clone(),
    )?);
    let orchestrator = Arc::new(UpdateOrchestrator::new(&config, host.clone())?);

    if args.json_events {
        spawn_event_printer(&orchestrator);
    }

    if args.once {
        let outcome = run_supervised(host.clone(), {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.check_for_updates(Trigger::Manual).await }
        })
        .await;
        info!("Update check finished: {:?}", outcome);
        return match outcome {
            Supervised::Completed(RunOutcome::Failed(kind)) => {
                Err(anyhow::anyhow!("update check failed ({})", kind))
            }
            _ => Ok(()),
        };
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.check_interval();
    let mut updates = Box::pin(run_supervised(host.clone(), {
        let orchestrator = orchestrator.clone();
        async move {
            if orchestrator.check_for_updates(Trigger::Startup).await != RunOutcome::Installed {
                orchestrator.run_periodic(interval, shutdown_rx).await;
            }
        }
    }));

    tokio::select! {
        result = &mut updates => {
            info!("Update loop ended: {:?}", result);
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            if !wait_for_run(updates, SHUTDOWN_GRACE).await {
                // Dropping the runtime would wait on the blocking stdin read.
                warn!("Update run still active at shutdown, abandoning it");
                std::process::exit(0);
            }
        }
    }

    info!("gantry stopped");
    Ok(())
}
