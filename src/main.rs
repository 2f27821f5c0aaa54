//! # MQ Exchange - Main Entry Point
//!
//! Runs one scenario against a queue manager and writes its results.
//!
//! 1. **Parse arguments**: command line, with connection settings falling
//!    back to `MQ_*` environment variables
//! 2. **Initialize logging**: colored terminal output, or a plain log file
//! 3. **Connect**: probe the queue manager, then open the long-lived client
//!    connection
//! 4. **Run the scenario**: round trip, drain or validate
//! 5. **Report**: log a summary and write JSON results
//!
//! The bundled transport is the in-process loopback queue manager, with the
//! source, reply and drain queues defined up front, so every scenario runs
//! self-contained. Use `--simulate-reply` for round trips and `--preload` for
//! drains to give them traffic.

use anyhow::{Context, Result};
use clap::Parser;
use mq_exchange::{
    cli::Args,
    logging,
    results::ResultsManager,
    scenario::{ScenarioConfig, ScenarioRunner},
    Deadline, ExchangeClient, LoopbackQueueManager, VERSION,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!("Starting MQ Exchange {}", VERSION);

    let config = ScenarioConfig::from_args(&args)?;
    let descriptor = args.connection_descriptor();
    info!("Connecting to {}", descriptor);

    let queue_manager = LoopbackQueueManager::with_queues(
        descriptor.queue_manager.clone(),
        [&config.source_queue, &config.reply_queue, &config.queue],
    );
    info!(
        "Using in-process loopback queue manager '{}'",
        queue_manager.name()
    );

    let client = ExchangeClient::connect(
        Arc::new(queue_manager),
        descriptor,
        args.exchange_config(),
        Deadline::none(),
    )
    .await
    .context("Failed to connect to queue manager")?;
    let client = Arc::new(client);

    let mut results_manager = ResultsManager::new(&args.output_file)?;
    let runner = ScenarioRunner::new(Arc::clone(&client), config);
    let outcome = runner.run().await;

    // Release the cached handle and connection whatever the outcome.
    client.shutdown().await;

    match outcome {
        Ok(results) => {
            results.log_summary();
            results_manager.add_results(results);
            results_manager.finalize()?;
        }
        Err(e) => {
            error!("{} scenario failed: {:#}", runner.config().scenario, e);
            return Err(e);
        }
    }

    info!("MQ Exchange completed successfully");
    Ok(())
}
