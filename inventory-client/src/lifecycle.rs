//! Run-to-completion contracts for the sender and receiver processes.
//!
//! The [`LifecycleController`] is the only place that opens and closes the
//! broker connection and the only place that decides the process exit code.
//!
//! - Publisher role: open → publish one envelope → close → exit
//! - Consumer role: open → subscribe → consume until shutdown → close → exit

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::broker::{
    BrokerConnection, BrokerErrorEvent, BrokerTopology, Publisher, Subscription,
};
use crate::consumer::Consumer;
use crate::envelope::MessageEnvelope;
use crate::error::{ConnectionError, PublishError, ShutdownError};

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Failure,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::Failure => 1,
        }
    }
}

impl From<Exit> for std::process::ExitCode {
    fn from(exit: Exit) -> Self {
        std::process::ExitCode::from(exit.code())
    }
}

/// Why a consumer stopped consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested, normally by a termination signal
    Shutdown,
    /// The broker reported a connection-level error
    BrokerError(BrokerErrorEvent),
    /// The broker ended the delivery stream
    SubscriptionEnded,
}

/// Idempotent shutdown latch shared between signal handlers and the run loop.
#[derive(Clone)]
pub struct ShutdownTrigger {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request shutdown. Returns `true` only for the first request.
    pub fn fire(&self, reason: &str) -> bool {
        let first = self.sender.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });

        if first {
            info!(reason = %reason, "shutdown_requested");
        } else {
            info!(reason = %reason, "shutdown_already_in_progress");
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn fired(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = receiver.wait_for(|fired| *fired).await;
    }
}

/// Map SIGINT and SIGTERM onto `trigger` until the returned task is aborted.
///
/// Every signal is forwarded; the trigger itself ignores all but the first.
pub fn listen_for_signals(trigger: ShutdownTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut terminate = install_terminate();
        let mut ctrl_c_enabled = true;

        loop {
            tokio::select! {
                result = signal::ctrl_c(), if ctrl_c_enabled => match result {
                    Ok(()) => {
                        trigger.fire("SIGINT");
                    }
                    Err(e) => {
                        error!(error = %e, "sigint_handler_install_failed");
                        ctrl_c_enabled = false;
                    }
                },
                _ = recv_terminate(&mut terminate) => {
                    trigger.fire("SIGTERM");
                }
            }
        }
    })
}

#[cfg(unix)]
type TerminateSignal = Option<signal::unix::Signal>;

#[cfg(not(unix))]
type TerminateSignal = ();

#[cfg(unix)]
fn install_terminate() -> TerminateSignal {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            error!(error = %e, "sigterm_handler_install_failed");
            None
        }
    }
}

#[cfg(not(unix))]
fn install_terminate() -> TerminateSignal {}

#[cfg(unix)]
async fn recv_terminate(terminate: &mut TerminateSignal) {
    if let Some(signal) = terminate.as_mut() {
        if signal.recv().await.is_some() {
            return;
        }
    }
    *terminate = None;
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
async fn recv_terminate(_terminate: &mut TerminateSignal) {
    std::future::pending::<()>().await
}

/// Consume `subscription` until shutdown, a broker error, or end of stream.
///
/// Each event is handled to completion before the next select, so a shutdown
/// request never interrupts a delivery that is being resolved.
pub async fn drive<E>(
    consumer: &Consumer,
    mut subscription: Subscription,
    errors: &mut E,
    shutdown: &ShutdownTrigger,
) -> StopReason
where
    E: Stream<Item = BrokerErrorEvent> + Unpin,
{
    let fired = shutdown.fired();
    tokio::pin!(fired);

    loop {
        tokio::select! {
            _ = &mut fired => {
                info!(subscription = %subscription.name(), "consumer_stopping");
                return StopReason::Shutdown;
            }
            Some(event) = errors.next() => {
                error!(
                    vhost = %event.vhost,
                    endpoint = %event.endpoint,
                    error = %event.message,
                    "broker_error_fatal"
                );
                return StopReason::BrokerError(event);
            }
            event = subscription.next() => match event {
                Some(event) => {
                    consumer.handle(event).await;
                }
                None => {
                    warn!(subscription = %subscription.name(), "rabbitmq_consumer_closed");
                    return StopReason::SubscriptionEnded;
                }
            }
        }
    }
}

/// Owns process-level startup, shutdown and exit code decisions.
pub struct LifecycleController {
    topology: Arc<BrokerTopology>,
    shutdown: ShutdownTrigger,
}

impl LifecycleController {
    pub fn new(topology: BrokerTopology) -> Self {
        Self {
            topology: Arc::new(topology),
            shutdown: ShutdownTrigger::new(),
        }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Open a connection, run `body` with it, then close it.
    ///
    /// The close runs on every path through `body`; its result is returned
    /// alongside the body output and logged separately.
    pub async fn with_connection<F, Fut, T>(
        &self,
        body: F,
    ) -> Result<(T, Result<(), ShutdownError>), ConnectionError>
    where
        F: FnOnce(Arc<BrokerConnection>) -> Fut,
        Fut: Future<Output = T>,
    {
        let connection = Arc::new(BrokerConnection::open(Arc::clone(&self.topology)).await?);

        let output = body(Arc::clone(&connection)).await;

        let closed = connection.close().await;
        log_close(&closed);

        Ok((output, closed))
    }

    /// Send one envelope and report the exit status.
    pub async fn run_publisher(
        &self,
        publisher: &Publisher,
        publication: &str,
        envelope: &MessageEnvelope,
    ) -> Exit {
        if let Err(e) = envelope.validate() {
            error!(item_id = %envelope.item_id, error = %e, "publish_validation_failed");
            return Exit::Failure;
        }

        let run = self
            .with_connection(|connection| async move {
                let mut errors = connection.errors();
                let watcher = tokio::spawn(async move {
                    while let Some(event) = errors.next().await {
                        error!(
                            vhost = %event.vhost,
                            endpoint = %event.endpoint,
                            error = %event.message,
                            "broker_error_during_publish"
                        );
                    }
                });

                let published = publisher.publish(&connection, publication, envelope).await;
                watcher.abort();
                published
            })
            .await;

        match run {
            Err(e) => {
                error!(error = %e, "broker_open_failed");
                Exit::Failure
            }
            Ok((published, closed)) => {
                match &published {
                    Ok(receipt) => info!(
                        message_id = %receipt.message_id,
                        queue = %receipt.queue,
                        confirmed = receipt.confirmed,
                        item_id = %envelope.item_id,
                        "inventory_message_sent"
                    ),
                    Err(PublishError::Validation(e)) => {
                        error!(item_id = %envelope.item_id, error = %e, "publish_validation_failed")
                    }
                    Err(e) => error!(item_id = %envelope.item_id, error = %e, "publish_failed"),
                }

                if published.is_ok() && closed.is_ok() {
                    Exit::Success
                } else {
                    Exit::Failure
                }
            }
        }
    }

    /// Consume until shutdown is requested and report the exit status.
    pub async fn run_consumer(&self, consumer: &Consumer, subscription: &str) -> Exit {
        let connection = match BrokerConnection::open(Arc::clone(&self.topology)).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "broker_open_failed");
                return Exit::Failure;
            }
        };

        let mut errors = connection.errors();

        let subscription = match consumer.subscribe(&connection, subscription).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(subscription = %subscription, error = %e, "subscribe_failed");
                log_close(&connection.close().await);
                return Exit::Failure;
            }
        };

        info!(
            subscription = %subscription.name(),
            queue = %subscription.queue(),
            "consumer_ready"
        );

        let stop = drive(consumer, subscription, &mut errors, &self.shutdown).await;

        let closed = connection.close().await;
        log_close(&closed);

        match (stop, closed) {
            (StopReason::Shutdown, Ok(())) => Exit::Success,
            _ => Exit::Failure,
        }
    }
}

fn log_close(closed: &Result<(), ShutdownError>) {
    match closed {
        Ok(()) => info!("broker_shutdown_complete"),
        Err(e) => error!(error = %e, "broker_close_failed"),
    }
}
