//! Publishing envelopes through a named publication.
//!
//! Each call to [`Publisher::publish`] validates one envelope, hands it to the
//! broker and waits for exactly one outcome: confirmed, failed, or returned
//! as unroutable. Nothing is queued locally and nothing is retried.

use std::time::Duration;

use lapin::{options::BasicPublishOptions, publisher_confirm::Confirmation, BasicProperties};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::connection::BrokerConnection;
use super::topology::BrokerTopology;
use crate::envelope::MessageEnvelope;
use crate::error::{DeliveryReturnedError, PublishError};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub publication: String,
    pub queue: String,
    pub message_id: String,
    /// Whether the broker confirmed the message (false when confirms are off)
    pub confirmed: bool,
}

/// A validated, encoded message ready to hand to the broker.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub publication: String,
    pub queue: String,
    /// Publish through the confirm-mode channel
    pub confirm: bool,
    pub mandatory: bool,
    pub message_id: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

/// Publishes envelopes, optionally bounding the wait for an outcome.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    timeout: Option<Duration>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting for an outcome after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and encode an envelope for the given publication.
    ///
    /// Does not touch the broker.
    pub fn prepare(
        &self,
        topology: &BrokerTopology,
        publication: &str,
        envelope: &MessageEnvelope,
    ) -> Result<PreparedMessage, PublishError> {
        envelope.validate()?;

        let spec = topology
            .publication(publication)
            .ok_or_else(|| PublishError::UnknownPublication(publication.to_string()))?;

        let durable = topology.queue(&spec.queue).is_some_and(|q| q.durable);
        let body = envelope.encode()?;
        let message_id = Uuid::new_v4().to_string();

        let properties = BasicProperties::default()
            .with_delivery_mode(if durable { PERSISTENT } else { TRANSIENT })
            .with_content_type("application/json".into())
            .with_message_id(message_id.clone().into());

        Ok(PreparedMessage {
            publication: publication.to_string(),
            queue: spec.queue.clone(),
            confirm: spec.uses_confirm_channel(),
            mandatory: spec.mandatory,
            message_id,
            body,
            properties,
        })
    }

    /// Publish one envelope and wait for its outcome.
    pub async fn publish(
        &self,
        connection: &BrokerConnection,
        publication: &str,
        envelope: &MessageEnvelope,
    ) -> Result<PublishReceipt, PublishError> {
        let prepared = match self.prepare(connection.topology(), publication, envelope) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(
                    publication = %publication,
                    item_id = %envelope.item_id,
                    error = %e,
                    "rabbitmq_publish_rejected"
                );
                return Err(e);
            }
        };

        let outcome = match self.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, send(connection, &prepared)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PublishError::Timeout {
                        message_id: prepared.message_id.clone(),
                        timeout,
                    }),
                }
            }
            None => send(connection, &prepared).await,
        };

        match outcome {
            Ok(confirmed) => {
                info!(
                    queue = %prepared.queue,
                    message_id = %prepared.message_id,
                    item_id = %envelope.item_id,
                    body_length = prepared.body.len(),
                    confirmed = confirmed,
                    "rabbitmq_message_published"
                );
                Ok(PublishReceipt {
                    publication: prepared.publication,
                    queue: prepared.queue,
                    message_id: prepared.message_id,
                    confirmed,
                })
            }
            Err(PublishError::Returned(returned)) => {
                warn!(
                    queue = %prepared.queue,
                    message_id = %returned.message_id,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text,
                    "rabbitmq_message_returned"
                );
                Err(PublishError::Returned(returned))
            }
            Err(e) => {
                error!(
                    queue = %prepared.queue,
                    message_id = %prepared.message_id,
                    error = %e,
                    "rabbitmq_publish_failed"
                );
                Err(e)
            }
        }
    }
}

/// Hand the message to the broker; `Ok(true)` when a confirm was received.
async fn send(connection: &BrokerConnection, prepared: &PreparedMessage) -> Result<bool, PublishError> {
    let broker_error = |source: lapin::Error| PublishError::Broker {
        message_id: prepared.message_id.clone(),
        source,
    };

    let confirmation = connection
        .publish_channel(prepared.confirm)
        .basic_publish(
            "",
            &prepared.queue,
            BasicPublishOptions {
                mandatory: prepared.mandatory,
                ..Default::default()
            },
            &prepared.body,
            prepared.properties.clone(),
        )
        .await
        .map_err(broker_error)?
        .await
        .map_err(broker_error)?;

    interpret_confirmation(confirmation, &prepared.message_id)
}

/// Map a broker confirmation onto the publish outcome.
fn interpret_confirmation(
    confirmation: Confirmation,
    message_id: &str,
) -> Result<bool, PublishError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(true),
        Confirmation::NotRequested => Ok(false),
        Confirmation::Nack(None) => Err(PublishError::Nacked {
            message_id: message_id.to_string(),
        }),
        Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
            let returned_id = returned
                .delivery
                .properties
                .message_id()
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| message_id.to_string());

            Err(DeliveryReturnedError {
                message_id: returned_id,
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
            }
            .into())
        }
    }
}
