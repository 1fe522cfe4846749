//! Inventory message consumer.
//!
//! Subscribes to a named subscription and resolves every delivery with an
//! explicit outcome:
//!
//! ```text
//! Received ─┬─ valid envelope ───────────→ Acknowledged
//!           ├─ fails validation ─────────→ RejectedNoRequeue
//!           └─ not JSON (invalid content) → RejectedNoRequeue
//! ```
//!
//! A message that fails validation is never requeued: redelivering it would
//! only reproduce the same failure.

use std::sync::Arc;

use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use tracing::{error, info};

use crate::broker::{
    BrokerConnection, DeliveryOutcome, InboundMessage, Subscription, SubscriptionEvent,
};
use crate::envelope::MessageEnvelope;
use crate::error::SubscriptionError;

/// Consumer tag announced to the broker.
pub const CONSUMER_TAG: &str = "inventory-receiver";

type Handler = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Validates deliveries and settles them with the broker.
#[derive(Clone)]
pub struct Consumer {
    consumer_tag: String,
    handler: Handler,
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new(CONSUMER_TAG)
    }
}

impl Consumer {
    /// Create a consumer that logs every valid envelope.
    pub fn new(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            handler: Arc::new(|envelope: &MessageEnvelope| {
                info!(
                    item_id = %envelope.item_id,
                    text = %envelope.text,
                    "inventory_message_received"
                );
            }),
        }
    }

    /// Run `handler` on each valid envelope before it is acknowledged.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Start consuming from a named subscription.
    ///
    /// This function:
    /// 1. Opens a dedicated channel for the subscription
    /// 2. Applies the subscription's prefetch count via QoS
    /// 3. Starts the broker-side consumer
    pub async fn subscribe(
        &self,
        connection: &BrokerConnection,
        subscription: &str,
    ) -> Result<Subscription, SubscriptionError> {
        let spec = connection
            .topology()
            .subscription(subscription)
            .ok_or_else(|| SubscriptionError::UnknownSubscription(subscription.to_string()))?
            .clone();

        let setup_error = |source: lapin::Error| SubscriptionError::Setup {
            subscription: subscription.to_string(),
            source,
        };

        let channel = connection.create_channel().await.map_err(setup_error)?;

        channel
            .basic_qos(spec.prefetch, BasicQosOptions::default())
            .await
            .map_err(setup_error)?;

        info!(prefetch_count = spec.prefetch, "rabbitmq_qos_set");

        let consumer = channel
            .basic_consume(
                &spec.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup_error)?;

        info!(
            subscription = %subscription,
            queue = %spec.queue,
            consumer_tag = %self.consumer_tag,
            "rabbitmq_consumer_started"
        );

        Ok(Subscription::from_consumer(subscription, spec.queue, channel, consumer))
    }

    /// Process one subscription event.
    ///
    /// Returns the outcome the delivery was resolved with, or `None` for
    /// subscription errors, which carry no delivery. Never fails: settle
    /// errors are logged.
    pub async fn handle(&self, event: SubscriptionEvent) -> Option<DeliveryOutcome> {
        match event {
            SubscriptionEvent::Message(message, content) => {
                let outcome = match MessageEnvelope::from_value(&content) {
                    Ok(envelope) => {
                        (self.handler)(&envelope);
                        DeliveryOutcome::Acknowledged
                    }
                    Err(e) => {
                        error!(
                            message_id = %message.message_id,
                            delivery_tag = message.delivery_tag,
                            error = %e,
                            "inventory_message_invalid"
                        );
                        DeliveryOutcome::RejectedNoRequeue
                    }
                };
                self.settle(message, outcome).await;
                Some(outcome)
            }
            SubscriptionEvent::InvalidContent(message, e) => {
                error!(
                    message_id = %message.message_id,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    body_preview = %message.body_preview(),
                    "inventory_invalid_content"
                );
                self.settle(message, DeliveryOutcome::RejectedNoRequeue).await;
                Some(DeliveryOutcome::RejectedNoRequeue)
            }
            SubscriptionEvent::Error(e) => {
                error!(error = %e, "rabbitmq_subscription_error");
                None
            }
        }
    }

    async fn settle(&self, message: InboundMessage, outcome: DeliveryOutcome) {
        let InboundMessage {
            message_id,
            delivery_tag,
            redelivered,
            resolver,
            ..
        } = message;

        match resolver.resolve(outcome).await {
            Ok(()) => info!(
                message_id = %message_id,
                delivery_tag = delivery_tag,
                redelivered = redelivered,
                outcome = outcome.as_str(),
                "rabbitmq_delivery_settled"
            ),
            Err(e) => error!(
                message_id = %message_id,
                delivery_tag = delivery_tag,
                outcome = outcome.as_str(),
                error = %e,
                "rabbitmq_settle_failed"
            ),
        }
    }
}
