//! Consumer-side delivery stream.
//!
//! A [`Subscription`] turns raw broker deliveries into [`SubscriptionEvent`]s:
//!
//! ```text
//! delivery ─┬─ JSON decodes ──────→ Message(message, content)
//!           ├─ JSON does not ─────→ InvalidContent(message, error)
//! error ────┴─────────────────────→ Error(error)
//! ```
//!
//! Every [`InboundMessage`] carries a [`Resolver`] that must be used exactly
//! once to settle the delivery with the broker.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{future::BoxFuture, stream::BoxStream, Stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    Channel,
};
use serde_json::Value;
use tracing::{error, warn};

use crate::envelope::decode_content;
use crate::error::{InvalidContentError, SubscriptionError};

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    RejectedNoRequeue,
    RejectedRequeue,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acknowledged => "acknowledged",
            DeliveryOutcome::RejectedNoRequeue => "rejected_no_requeue",
            DeliveryOutcome::RejectedRequeue => "rejected_requeue",
        }
    }
}

/// Sends a delivery outcome back to the broker.
pub trait Settle: Send + Sync + 'static {
    fn settle(&self, outcome: DeliveryOutcome) -> BoxFuture<'_, Result<(), lapin::Error>>;
}

impl Settle for Acker {
    fn settle(&self, outcome: DeliveryOutcome) -> BoxFuture<'_, Result<(), lapin::Error>> {
        Box::pin(async move {
            match outcome {
                DeliveryOutcome::Acknowledged => self.ack(BasicAckOptions::default()).await,
                DeliveryOutcome::RejectedNoRequeue => {
                    self.nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                }
                DeliveryOutcome::RejectedRequeue => {
                    self.nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                }
            }
        })
    }
}

/// Single-use handle for settling one delivery.
///
/// [`resolve`](Resolver::resolve) consumes the handle. A resolver dropped
/// without being resolved returns its delivery to the queue.
pub struct Resolver {
    settle: Option<Box<dyn Settle>>,
    delivery_tag: u64,
    message_id: String,
}

impl Resolver {
    pub fn new(settle: impl Settle, delivery_tag: u64, message_id: impl Into<String>) -> Self {
        Self {
            settle: Some(Box::new(settle)),
            delivery_tag,
            message_id: message_id.into(),
        }
    }

    /// Settle the delivery with the given outcome.
    pub async fn resolve(mut self, outcome: DeliveryOutcome) -> Result<(), SubscriptionError> {
        match self.settle.take() {
            Some(settle) => settle.settle(outcome).await.map_err(SubscriptionError::Delivery),
            None => Ok(()),
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let Some(settle) = self.settle.take() else {
            return;
        };

        error!(
            message_id = %self.message_id,
            delivery_tag = self.delivery_tag,
            "delivery_dropped_unresolved"
        );

        let delivery_tag = self.delivery_tag;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = settle.settle(DeliveryOutcome::RejectedRequeue).await {
                        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
                    }
                });
            }
            // The broker requeues the delivery itself once the channel closes
            Err(_) => warn!(delivery_tag = delivery_tag, "delivery_requeue_deferred_to_broker"),
        }
    }
}

/// A delivery received from a subscription.
pub struct InboundMessage {
    pub message_id: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub resolver: Resolver,
}

impl InboundMessage {
    pub fn new(
        data: Vec<u8>,
        message_id: impl Into<String>,
        delivery_tag: u64,
        settle: impl Settle,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            resolver: Resolver::new(settle, delivery_tag, message_id.clone()),
            message_id,
            delivery_tag,
            redelivered: false,
            data,
        }
    }

    pub(crate) fn from_delivery(delivery: Delivery) -> Self {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut message = Self::new(
            delivery.data,
            message_id,
            delivery.delivery_tag,
            delivery.acker,
        );
        message.redelivered = delivery.redelivered;
        message
    }

    /// First bytes of the body, for log context.
    pub fn body_preview(&self) -> String {
        String::from_utf8_lossy(&self.data[..self.data.len().min(500)]).into_owned()
    }
}

/// One event produced by a subscription.
pub enum SubscriptionEvent {
    /// Delivery whose body decoded as JSON
    Message(InboundMessage, Value),
    /// Delivery whose body is not JSON
    InvalidContent(InboundMessage, InvalidContentError),
    /// Delivery-channel fault; the subscription keeps running
    Error(SubscriptionError),
}

/// Stream of events for one named subscription.
pub struct Subscription {
    name: String,
    queue: String,
    deliveries: BoxStream<'static, Result<InboundMessage, SubscriptionError>>,
    // Keeps the consumer channel open for as long as the subscription lives
    _channel: Option<Channel>,
}

impl Subscription {
    /// Build a subscription over any stream of deliveries.
    pub fn from_stream<S>(name: impl Into<String>, queue: impl Into<String>, deliveries: S) -> Self
    where
        S: Stream<Item = Result<InboundMessage, SubscriptionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            queue: queue.into(),
            deliveries: deliveries.boxed(),
            _channel: None,
        }
    }

    /// Wrap a lapin consumer running on `channel`.
    pub(crate) fn from_consumer(
        name: impl Into<String>,
        queue: impl Into<String>,
        channel: Channel,
        consumer: lapin::Consumer,
    ) -> Self {
        let deliveries = consumer.map(|delivery| {
            delivery
                .map(InboundMessage::from_delivery)
                .map_err(SubscriptionError::Delivery)
        });

        let mut subscription = Self::from_stream(name, queue, deliveries);
        subscription._channel = Some(channel);
        subscription
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.deliveries.poll_next_unpin(cx).map(|item| {
            item.map(|delivery| match delivery {
                Ok(message) => match decode_content(&message.data) {
                    Ok(content) => SubscriptionEvent::Message(message, content),
                    Err(err) => SubscriptionEvent::InvalidContent(message, err),
                },
                Err(err) => SubscriptionEvent::Error(err),
            })
        })
    }
}
