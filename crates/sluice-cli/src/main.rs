//! sluice - run a sequence of connectors through an enrichment pipeline
//!
//! Reads a YAML configuration, instantiates the configured connectors, and
//! executes them sequentially as one run. By default all components run in
//! this process with in-memory queues; with `--kafka` (requires the
//! `kafka` build feature) message traffic flows through a broker, and
//! `--local` additionally hosts the workers and indexer in this process.
//!
//! Exit codes: 0 on success, 1 on configuration or argument errors, 2 when
//! the run aborted because a connector failed or timed out.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice_core::{ConnectorOutcome, MemoryBackend, Runner, SluiceConfig};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Run a sequence of connectors through an enrichment pipeline")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sluice.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the configured run (default)
    Run {
        /// Route message traffic through the configured broker instead of
        /// in-memory queues
        #[arg(long)]
        kafka: bool,

        /// With --kafka, also host workers and indexer in this process
        #[arg(long)]
        local: bool,
    },
    /// Check the configuration and print a summary
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Commands::Run {
        kafka: false,
        local: false,
    }) {
        Commands::Validate => {
            print_summary(&config);
            ExitCode::SUCCESS
        }
        Commands::Run { kafka, local } => run(config, kafka, local).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn load_config(path: &PathBuf) -> Result<SluiceConfig, String> {
    let config = SluiceConfig::from_file(path)
        .map_err(|e| format!("failed to load config from {}: {e}", path.display()))?;
    config
        .validate()
        .map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(config)
}

async fn run(config: SluiceConfig, kafka: bool, local: bool) -> ExitCode {
    let connectors = match sluice_connect::build_connectors(&config) {
        Ok(connectors) => connectors,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };
    if connectors.is_empty() {
        error!("no connectors configured");
        return ExitCode::from(1);
    }

    let backend = Arc::new(MemoryBackend::new());
    let runner = match execution_mode(kafka, local) {
        Ok(mode) => Runner::new(config, backend.clone()).with_mode(mode),
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let summary = runner.run(connectors).await;
    for connector in &summary.connectors {
        match &connector.outcome {
            ConnectorOutcome::Completed => info!(
                "connector '{}' completed in {:.2}s",
                connector.name,
                connector.elapsed.as_secs_f64()
            ),
            ConnectorOutcome::Skipped => info!("connector '{}' skipped", connector.name),
            outcome => error!(
                "connector '{}' {:?}: {}",
                connector.name,
                outcome,
                connector.message.as_deref().unwrap_or("no detail")
            ),
        }
    }

    if summary.succeeded() {
        info!(
            run_id = summary.run_id.as_str(),
            indexed = backend.stored().len(),
            "run complete in {:.2}s",
            summary.elapsed.as_secs_f64()
        );
        ExitCode::SUCCESS
    } else {
        error!(run_id = summary.run_id.as_str(), "run aborted");
        ExitCode::from(2)
    }
}

#[cfg(feature = "kafka")]
fn execution_mode(kafka: bool, local: bool) -> Result<sluice_core::ExecutionMode, String> {
    use sluice_core::ExecutionMode;
    Ok(if kafka {
        ExecutionMode::Kafka {
            start_workers: local,
        }
    } else {
        ExecutionMode::Local
    })
}

#[cfg(not(feature = "kafka"))]
fn execution_mode(kafka: bool, _local: bool) -> Result<sluice_core::ExecutionMode, String> {
    if kafka {
        return Err("broker mode requires a build with the 'kafka' feature".to_string());
    }
    Ok(sluice_core::ExecutionMode::Local)
}

fn print_summary(config: &SluiceConfig) {
    println!("Configuration valid.");
    println!();
    println!("Runner:");
    println!(
        "  Connector timeout: {}ms",
        config.runner.connector_timeout_ms
    );
    println!();
    println!("Worker:");
    println!("  Threads: {}", config.worker.threads);
    match config.worker.queue_capacity {
        Some(capacity) => println!("  Queue capacity: {capacity}"),
        None => println!("  Queue capacity: unbounded"),
    }
    println!();
    println!("Indexer:");
    println!("  Index: {}", config.indexer.index);
    println!("  Batch size: {}", config.indexer.batch_size);
    println!("  Batch timeout: {}ms", config.indexer.batch_timeout_ms);
    println!();
    println!("Pipelines ({}):", config.pipelines.len());
    for pipeline in &config.pipelines {
        println!("  {} ({} stages)", pipeline.name, pipeline.stages.len());
    }
    println!();
    println!("Connectors ({}):", config.connectors.len());
    for connector in &config.connectors {
        println!(
            "  {} ({}) -> pipeline: {}",
            connector.name,
            connector.connector,
            connector.pipeline.as_deref().unwrap_or("-")
        );
    }
}
