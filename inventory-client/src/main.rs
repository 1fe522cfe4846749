//! Inventory Receiver - consumes inventory check messages until terminated.
//!
//! Every delivery is validated and then acknowledged, or rejected without
//! requeue when it is not a valid envelope. SIGINT and SIGTERM trigger a
//! single graceful shutdown of the broker connection.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::info;

use inventory::{listen_for_signals, telemetry, Config, Consumer, LifecycleController, CONSUMER_TAG};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    telemetry::init();

    info!("receiver_starting");

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        endpoint = %config.topology.connection.endpoint(),
        subscription = %config.subscription,
        "config_loaded"
    );

    let controller = LifecycleController::new(config.topology);
    let signals = listen_for_signals(controller.shutdown_trigger());

    info!("Waiting for messages. To exit press CTRL+C");

    let consumer = Consumer::new(CONSUMER_TAG);
    let exit = controller.run_consumer(&consumer, &config.subscription).await;

    signals.abort();
    info!(exit_code = exit.code(), "receiver_shutdown_complete");

    Ok(exit.into())
}
