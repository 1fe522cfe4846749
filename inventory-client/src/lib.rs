//! Inventory messaging client - reliable RabbitMQ publisher/consumer pair.
//!
//! This library provides shared modules for the two binaries:
//! - `inventory-sender`: publishes one inventory check message and exits
//! - `inventory-receiver`: consumes inventory check messages until terminated
//!
//! ## Architecture
//!
//! ```text
//! Sender → inventory_check → product_inventory queue → inventory_listener → Receiver
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod telemetry;

// Re-export commonly used types
pub use broker::{
    BrokerConnection, BrokerTopology, DeliveryOutcome, PublishReceipt, Publisher, Subscription,
    SubscriptionEvent,
};
pub use config::Config;
pub use consumer::{Consumer, CONSUMER_TAG};
pub use envelope::MessageEnvelope;
pub use lifecycle::{listen_for_signals, Exit, LifecycleController, ShutdownTrigger};
