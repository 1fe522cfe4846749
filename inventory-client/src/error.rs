//! Error types for envelope handling and broker operations.
//!
//! Each broker-facing operation has its own error type so callers can tell a
//! rejected message apart from a broken connection:
//!
//! - [`ValidationError`] / [`InvalidContentError`]: the message itself is bad,
//!   never retried
//! - [`ConnectionError`], [`PublishError`], [`SubscriptionError`],
//!   [`ShutdownError`]: broker-side failures surfaced to the lifecycle

use std::time::Duration;

use thiserror::Error;

/// Envelope failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("message must contain a string {0}")]
    MissingField(&'static str),

    #[error("{0} must be a string")]
    NotAString(&'static str),

    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

/// Received bytes could not be decoded as JSON at all.
#[derive(Debug, Error)]
#[error("content is not a JSON document: {0}")]
pub struct InvalidContentError(#[from] pub serde_json::Error);

/// Broker topology or connection parameters are unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required connection parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{kind} {name} references undeclared queue {queue}")]
    UnknownQueue {
        kind: &'static str,
        name: String,
        queue: String,
    },

    #[error("invalid broker url: {0}")]
    Url(#[from] url::ParseError),
}

/// Session with the broker could not be established.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid topology: {0}")]
    Topology(#[from] ConfigError),

    #[error("failed to connect to broker at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to enable publisher confirms: {0}")]
    ConfirmSelect(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: lapin::Error,
    },
}

/// A published message was accepted but handed back as undeliverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message {message_id} was returned by the broker: {reply_code} {reply_text}")]
pub struct DeliveryReturnedError {
    pub message_id: String,
    pub reply_code: u16,
    pub reply_text: String,
}

/// A single publish attempt failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("unknown publication {0}")]
    UnknownPublication(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker failed publish of {message_id}: {source}")]
    Broker {
        message_id: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker negatively acknowledged message {message_id}")]
    Nacked { message_id: String },

    #[error(transparent)]
    Returned(#[from] DeliveryReturnedError),

    #[error("no publish outcome for {message_id} within {timeout:?}")]
    Timeout {
        message_id: String,
        timeout: Duration,
    },
}

impl PublishError {
    /// Whether the failure happened before the broker was contacted.
    pub fn is_validation(&self) -> bool {
        matches!(self, PublishError::Validation(_))
    }
}

/// Consumer-side broker failure.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("unknown subscription {0}")]
    UnknownSubscription(String),

    #[error("failed to start subscription {subscription}: {source}")]
    Setup {
        subscription: String,
        #[source]
        source: lapin::Error,
    },

    #[error("delivery channel error: {0}")]
    Delivery(#[from] lapin::Error),
}

/// Teardown of the broker session failed.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to close channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to close connection: {0}")]
    Connection(#[source] lapin::Error),

    #[error("connection was lost before shutdown")]
    ConnectionLost,
}
