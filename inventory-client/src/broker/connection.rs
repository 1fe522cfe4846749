//! Broker session management using lapin.
//!
//! A [`BrokerConnection`] owns exactly one AMQP connection plus the channels
//! opened on it. Opening fails fast (there is no reconnect loop), asynchronous
//! connection errors are surfaced as a stream, and closing is idempotent.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use lapin::{options::ConfirmSelectOptions, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::topology::BrokerTopology;
use crate::error::{ConnectionError, ShutdownError};

/// Reply code sent to the broker on a clean close.
const NORMAL_SHUTDOWN: u16 = 200;

/// Asynchronous failure reported by the broker for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerErrorEvent {
    pub vhost: String,
    pub endpoint: String,
    pub message: String,
}

/// Stream of [`BrokerErrorEvent`]s for one connection.
///
/// Ends once the connection is dropped. Obtained once per connection via
/// [`BrokerConnection::errors`].
pub struct BrokerErrors {
    receiver: Option<mpsc::UnboundedReceiver<BrokerErrorEvent>>,
}

impl BrokerErrors {
    pub(crate) fn from_receiver(receiver: mpsc::UnboundedReceiver<BrokerErrorEvent>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    fn exhausted() -> Self {
        Self { receiver: None }
    }
}

impl Stream for BrokerErrors {
    type Item = BrokerErrorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// One logical session with the broker.
pub struct BrokerConnection {
    topology: Arc<BrokerTopology>,
    connection: Connection,
    publish_channel: Channel,
    confirm_channel: Option<Channel>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<BrokerErrorEvent>>>,
    closed: AtomicBool,
}

impl BrokerConnection {
    /// Connect to the broker and prepare channels and queues.
    ///
    /// This function:
    /// 1. Validates the topology
    /// 2. Connects once, without retrying
    /// 3. Opens the publish channel (and a confirm-mode channel if any
    ///    publication needs confirms or is mandatory)
    /// 4. Declares every queue in the topology (idempotent on the broker)
    ///
    /// If the connection is established but setup fails, the connection is
    /// closed best-effort before the setup error is returned.
    pub async fn open(topology: Arc<BrokerTopology>) -> Result<Self, ConnectionError> {
        topology.validate()?;

        let params = &topology.connection;
        let url = params.amqp_url()?;
        let endpoint = params.endpoint();

        info!(endpoint = %endpoint, "rabbitmq_connecting");

        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|source| ConnectionError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        info!(endpoint = %endpoint, "rabbitmq_connected");

        let (sender, receiver) = mpsc::unbounded_channel();
        let vhost = params.vhost.clone();
        let error_endpoint = endpoint.clone();
        connection.on_error(move |err| {
            warn!(vhost = %vhost, endpoint = %error_endpoint, error = %err, "rabbitmq_connection_error");
            // Nobody listening means the session is already being torn down
            let _ = sender.send(BrokerErrorEvent {
                vhost: vhost.clone(),
                endpoint: error_endpoint.clone(),
                message: err.to_string(),
            });
        });

        match prepare_channels(&connection, &topology).await {
            Ok((publish_channel, confirm_channel)) => Ok(Self {
                topology,
                connection,
                publish_channel,
                confirm_channel,
                errors: Mutex::new(Some(receiver)),
                closed: AtomicBool::new(false),
            }),
            Err(err) => {
                error!(endpoint = %endpoint, error = %err, "rabbitmq_session_setup_failed");
                match connection.close(NORMAL_SHUTDOWN, "Session setup failed").await {
                    Ok(()) => info!("rabbitmq_connection_closed"),
                    Err(e) => warn!(error = %e, "rabbitmq_connection_close_error"),
                }
                Err(err)
            }
        }
    }

    /// The topology this session was opened with.
    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    /// Take the stream of asynchronous broker errors.
    ///
    /// The stream can be taken once; later calls return a stream that is
    /// already finished.
    pub fn errors(&self) -> BrokerErrors {
        let receiver = self.errors.lock().ok().and_then(|mut slot| slot.take());
        match receiver {
            Some(receiver) => BrokerErrors::from_receiver(receiver),
            None => BrokerErrors::exhausted(),
        }
    }

    /// Channel for publishing, in confirm mode if requested and available.
    pub(crate) fn publish_channel(&self, confirm: bool) -> &Channel {
        match (&self.confirm_channel, confirm) {
            (Some(channel), true) => channel,
            _ => &self.publish_channel,
        }
    }

    /// Open an additional channel, e.g. one per subscription.
    pub(crate) async fn create_channel(&self) -> Result<Channel, lapin::Error> {
        self.connection.create_channel().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close channels and the connection.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("rabbitmq_close_already_done");
            return Ok(());
        }

        let status = self.connection.status();
        if !status.connected() {
            if status.errored() {
                warn!("rabbitmq_close_after_connection_lost");
                return Err(ShutdownError::ConnectionLost);
            }
            info!("rabbitmq_connection_already_closed");
            return Ok(());
        }

        let mut first_error = None;
        let channels = self.confirm_channel.iter().chain(Some(&self.publish_channel));
        for channel in channels {
            if !channel.status().connected() {
                continue;
            }
            if let Err(e) = channel.close(NORMAL_SHUTDOWN, "Normal shutdown").await {
                warn!(channel_id = channel.id(), error = %e, "rabbitmq_channel_close_error");
                first_error.get_or_insert(ShutdownError::Channel(e));
            }
        }

        if let Err(e) = self.connection.close(NORMAL_SHUTDOWN, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
            return Err(first_error.unwrap_or(ShutdownError::Connection(e)));
        }

        info!(endpoint = %self.topology.connection.endpoint(), "rabbitmq_connection_closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if !self.is_closed() && self.connection.status().connected() {
            warn!("rabbitmq_connection_dropped_without_close");
        }
    }
}

async fn prepare_channels(
    connection: &Connection,
    topology: &BrokerTopology,
) -> Result<(Channel, Option<Channel>), ConnectionError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(ConnectionError::Channel)?;

    info!(channel_id = channel.id(), "rabbitmq_channel_created");

    for (name, spec) in &topology.queues {
        channel
            .queue_declare(name, spec.declare_options(), spec.arguments_table()?)
            .await
            .map_err(|source| ConnectionError::DeclareQueue {
                queue: name.clone(),
                source,
            })?;

        info!(queue = %name, durable = spec.durable, "rabbitmq_queue_declared");
    }

    let confirm_channel = if topology.requires_confirms() {
        let confirm = connection
            .create_channel()
            .await
            .map_err(ConnectionError::Channel)?;
        confirm
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(ConnectionError::ConfirmSelect)?;

        info!(channel_id = confirm.id(), "rabbitmq_confirms_enabled");
        Some(confirm)
    } else {
        None
    };

    Ok((channel, confirm_channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use crate::broker::topology::{ConnectionParams, PublicationSpec, QueueSpec};

    #[tokio::test]
    async fn test_error_stream_yields_events_in_order() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut errors = BrokerErrors::from_receiver(receiver);

        for message in ["heartbeat timeout", "channel closed"] {
            sender
                .send(BrokerErrorEvent {
                    vhost: "/".to_string(),
                    endpoint: "amqp://localhost:5672/".to_string(),
                    message: message.to_string(),
                })
                .unwrap();
        }
        drop(sender);

        let messages: Vec<String> = errors.by_ref().map(|e| e.message).collect().await;
        assert_eq!(messages, vec!["heartbeat timeout", "channel closed"]);
        assert!(errors.next().await.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_error_stream_is_empty() {
        let mut errors = BrokerErrors::exhausted();
        assert!(errors.next().await.is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_topology_before_connecting() {
        let topology = BrokerTopology::new(ConnectionParams {
            host: String::new(),
            ..Default::default()
        });

        let result = BrokerConnection::open(Arc::new(topology)).await;
        assert!(matches!(result, Err(ConnectionError::Topology(_))));
    }

    #[tokio::test]
    async fn test_open_fails_fast_when_broker_unreachable() {
        let topology = BrokerTopology::new(ConnectionParams {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout_ms: Some(2000),
            ..Default::default()
        })
        .with_queue("q", QueueSpec::default())
        .with_publication("p", PublicationSpec::new("q", true));

        let result = BrokerConnection::open(Arc::new(topology)).await;
        match result {
            Err(ConnectionError::Connect { endpoint, .. }) => {
                assert_eq!(endpoint, "amqp://127.0.0.1:1/");
            }
            Err(other) => panic!("Expected Connect error, got {}", other),
            Ok(_) => panic!("Expected Connect error, got a connection"),
        }
    }
}
