//! Broker module for RabbitMQ operations.
//!
//! This module provides:
//! - The broker topology (connection parameters, queues, routes)
//! - A single-session connection with fail-fast open and idempotent close
//! - A publisher with confirm/return handling
//! - Subscriptions yielding single-resolution deliveries
//!
//! ## Architecture
//!
//! ```text
//! Sender → Publisher → product_inventory queue → Subscription → Consumer
//! ```

pub mod connection;
pub mod publisher;
pub mod subscription;
pub mod topology;

pub use connection::{BrokerConnection, BrokerErrorEvent, BrokerErrors};
pub use publisher::{PreparedMessage, PublishReceipt, Publisher};
pub use subscription::{
    DeliveryOutcome, InboundMessage, Resolver, Settle, Subscription, SubscriptionEvent,
};
pub use topology::{
    BrokerTopology, ConnectionParams, PublicationSpec, QueueSpec, SubscriptionSpec,
    INVENTORY_PUBLICATION, INVENTORY_QUEUE, INVENTORY_SUBSCRIPTION,
};
