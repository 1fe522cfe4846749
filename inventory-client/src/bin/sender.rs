//! Inventory Sender - publishes one inventory check message and exits.
//!
//! The message is taken from `MESSAGE_ITEM_ID` / `MESSAGE_TEXT`. The process
//! exits 0 only when the broker accepted the message and the connection was
//! closed cleanly.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use inventory::{telemetry, Config, LifecycleController, MessageEnvelope, Publisher};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    telemetry::init();

    info!("sender_starting");

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        endpoint = %config.topology.connection.endpoint(),
        publication = %config.publication,
        publish_timeout_ms = config.publish_timeout_ms,
        "config_loaded"
    );

    let envelope = MessageEnvelope::new(config.message_item_id, config.message_text);
    let publisher = Publisher::new().with_timeout(Duration::from_millis(config.publish_timeout_ms));

    let controller = LifecycleController::new(config.topology);
    let exit = controller
        .run_publisher(&publisher, &config.publication, &envelope)
        .await;

    info!(exit_code = exit.code(), "sender_shutdown_complete");

    Ok(exit.into())
}
