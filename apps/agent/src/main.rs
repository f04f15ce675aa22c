use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use logger::{LogLevel, init_tracing};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use picket_agent::config::Config;
use picket_agent::error::{ConfigError, FetchError};
use picket_agent::hub::{CheckSource, HubClient};
use picket_agent::listener;
use picket_agent::monitoring::StandardChecker;
use picket_agent::monitoring::ping::{Pinger, SystemPinger};
use picket_agent::orchestrator::{FileSink, HubSink, Orchestrator, ResultDeliverer, ResultSink};
use picket_agent::stats::{Stats, spawn_stats_writer};

/// Results buffered between the workers and the delivery task
const RESULT_BUFFER: usize = 10_000;

#[derive(Parser, Debug)]
#[command(name = "picket", author, version, about = "Distributed monitoring agent")]
struct Args {
    /// Config file, created with defaults when missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read checks from a JSON file instead of the hub
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write results as JSON lines to a file instead of the hub
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run every check once, deliver the results and exit
    #[arg(long)]
    once: bool,

    /// Log level (debug, info, error), overrides the config
    #[arg(short = 'v', long = "log-level")]
    log_level: Option<LogLevel>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// A hub request timeout out of range is reset and reported, every other
/// problem stops the agent.
fn sanitize(config: &mut Config) -> Result<()> {
    match config.sanitize() {
        Ok(()) => Ok(()),
        Err(e @ ConfigError::Invalid { field: "hub_request_timeout", .. }) => {
            warn!("{}, using {}s", e, config.hub_request_timeout);
            config.sanitize().context("invalid config")
        }
        Err(e) => Err(e).context("invalid config"),
    }
}

/// A missing hub and input file is a configuration problem, not a crash.
fn finish(outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(e) if matches!(e.downcast_ref::<FetchError>(), Some(FetchError::MissingHubOrInput)) => {
            error!("{}, exiting", e);
            Ok(())
        }
        other => other,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_config(args.config.as_ref()).context("failed to load config")?;
    if let Some(level) = args.log_level {
        config.log_level = level.as_str().to_string();
    }
    init_tracing(config.log_level.parse().unwrap_or_default());
    sanitize(&mut config)?;

    if args.print_config {
        println!("{config}");
        return Ok(());
    }

    let config = Arc::new(config);
    let stats = Arc::new(Stats::new());

    let hub = if config.hub_url.is_empty() {
        None
    } else {
        Some(Arc::new(HubClient::new(&config, stats.clone())?))
    };

    let source = match (&args.input, &hub) {
        (Some(path), _) => CheckSource::File(path.clone()),
        (None, Some(hub)) => CheckSource::Hub(hub.clone()),
        (None, None) => CheckSource::Unconfigured,
    };

    let sink: Arc<dyn ResultSink> = match (&args.output, &hub) {
        (Some(path), _) => Arc::new(
            FileSink::create(path)
                .await
                .with_context(|| format!("failed to create output file '{}'", path.display()))?,
        ),
        (None, Some(hub)) => Arc::new(HubSink(hub.clone())),
        (None, None) => Arc::new(FileSink::stdout()),
    };

    let pinger: Arc<dyn Pinger> = Arc::new(SystemPinger);
    let checker = Arc::new(StandardChecker::new(&config, pinger.clone())?);
    let orchestrator = Orchestrator::new(config.clone(), source, checker, pinger, stats.clone())?;

    let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER);
    let deliverer = tokio::spawn(ResultDeliverer::new(&config, sink, stats.clone()).run(results_rx));

    if args.once {
        let outcome = orchestrator.run_once(results_tx).await.map(|_| ());
        if let Err(e) = deliverer.await {
            error!("Result delivery failed: {}", e);
        }
        return finish(outcome);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let stats_writer = spawn_stats_writer(
        stats.clone(),
        orchestrator.queue().clone(),
        config.stats_file.clone(),
        config.queue_stats_file.clone(),
        shutdown_rx.clone(),
    );

    let server = listener::start(&config.http_listener, orchestrator.executor().clone(), config.node_name.clone())
        .context("failed to start HTTP listener")?;

    let interrupt = {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, finishing in-flight checks");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => error!("Failed to listen for interrupts: {}", e),
            }
        })
    };

    info!("picket {} started as node '{}'", env!("CARGO_PKG_VERSION"), config.node_name);
    let outcome = orchestrator.run(results_tx, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    interrupt.abort();
    if let Some(server) = server {
        server.stop(true).await;
    }
    if let Err(e) = deliverer.await {
        error!("Result delivery failed: {}", e);
    }
    if let Err(e) = stats_writer.await {
        error!("Stats writer failed: {}", e);
    }

    info!("Shutdown complete");
    finish(outcome)
}
