//! Configuration module for environment variable parsing.
//!
//! Reads all configuration from environment variables and turns it into a
//! validated [`BrokerTopology`] plus the runtime settings of the binaries.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use serde_json::Value;
use tracing::warn;

use crate::broker::{
    BrokerTopology, ConnectionParams, PublicationSpec, QueueSpec, SubscriptionSpec,
    INVENTORY_PUBLICATION, INVENTORY_QUEUE, INVENTORY_SUBSCRIPTION,
};
use crate::error::ConfigError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection parameters and queue/publication/subscription routes
    pub topology: BrokerTopology,

    /// Publication the sender publishes through
    pub publication: String,

    /// Subscription the receiver consumes from
    pub subscription: String,

    /// How long the sender waits for a publish outcome
    pub publish_timeout_ms: u64,

    /// Item id of the message the sender publishes
    pub message_item_id: String,

    /// Body of the message the sender publishes
    pub message_text: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConnectionParams::default();

        let connection = ConnectionParams {
            protocol: lookup("AMQP_PROTOCOL").unwrap_or(defaults.protocol),
            host: lookup("AMQP_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "AMQP_PORT", defaults.port),
            user: lookup("AMQP_USER").unwrap_or(defaults.user),
            password: lookup("AMQP_PASSWORD").unwrap_or(defaults.password),
            vhost: lookup("AMQP_VHOST").unwrap_or(defaults.vhost),
            heartbeat_secs: parse_optional(&lookup, "AMQP_HEARTBEAT_SECS"),
            connection_timeout_ms: Some(parse_or(&lookup, "AMQP_CONNECTION_TIMEOUT_MS", 10_000)),
        };

        let queue = lookup("INVENTORY_QUEUE").unwrap_or_else(|| INVENTORY_QUEUE.to_string());

        let queue_spec = QueueSpec {
            durable: parse_bool(&lookup, "QUEUE_DURABLE", false),
            auto_delete: false,
            arguments: parse_arguments(&lookup, "QUEUE_ARGUMENTS")?,
        };

        let confirm = parse_bool(&lookup, "PUBLISH_CONFIRM", true);
        let prefetch = parse_or(&lookup, "PREFETCH_COUNT", 10);

        let topology = BrokerTopology::new(connection)
            .with_queue(queue.clone(), queue_spec)
            .with_publication(INVENTORY_PUBLICATION, PublicationSpec::new(queue.clone(), confirm))
            .with_subscription(INVENTORY_SUBSCRIPTION, SubscriptionSpec::new(queue, prefetch));

        topology.validate()?;

        Ok(Config {
            topology,
            publication: INVENTORY_PUBLICATION.to_string(),
            subscription: INVENTORY_SUBSCRIPTION.to_string(),
            publish_timeout_ms: parse_or(&lookup, "PUBLISH_TIMEOUT_MS", 10_000),
            message_item_id: lookup("MESSAGE_ITEM_ID").unwrap_or_else(|| "macbook".to_string()),
            message_text: lookup("MESSAGE_TEXT")
                .unwrap_or_else(|| "check availability".to_string()),
        })
    }
}

/// Parse a value, warning and falling back to the default when malformed.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    parse_optional(lookup, name).unwrap_or(default)
}

fn parse_optional<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

/// Parse a boolean flag such as "true", "1", "yes".
fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(name) {
        Some(v) => v,
        None => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

/// Parse a JSON object of queue declaration arguments.
fn parse_arguments<F>(lookup: &F, name: &'static str) -> Result<BTreeMap<String, Value>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(name) {
        Some(v) if !v.trim().is_empty() => v,
        _ => return Ok(BTreeMap::new()),
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        _ => Err(ConfigError::InvalidValue { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.publication, "inventory_check");
        assert_eq!(config.subscription, "inventory_listener");
        assert_eq!(config.message_item_id, "macbook");
        assert_eq!(config.message_text, "check availability");
        assert_eq!(config.publish_timeout_ms, 10_000);

        let topology = &config.topology;
        assert_eq!(topology.connection.host, "localhost");
        assert_eq!(topology.connection.port, 5672);
        assert_eq!(topology.queue("product_inventory"), Some(&QueueSpec::durable(false)));

        let publication = topology.publication("inventory_check").unwrap();
        assert_eq!(publication.queue, "product_inventory");
        assert!(publication.confirm);

        let subscription = topology.subscription("inventory_listener").unwrap();
        assert_eq!(subscription.prefetch, 10);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("AMQP_HOST", "rabbit.internal"),
            ("AMQP_PORT", "5671"),
            ("AMQP_PROTOCOL", "amqps"),
            ("INVENTORY_QUEUE", "stock"),
            ("QUEUE_DURABLE", "yes"),
            ("PUBLISH_CONFIRM", "false"),
            ("PREFETCH_COUNT", "50"),
            ("QUEUE_ARGUMENTS", r#"{"x-message-ttl": 60000}"#),
        ]))
        .unwrap();

        let topology = &config.topology;
        assert_eq!(topology.connection.endpoint(), "amqps://rabbit.internal:5671/");

        let queue = topology.queue("stock").unwrap();
        assert!(queue.durable);
        assert_eq!(queue.arguments.get("x-message-ttl"), Some(&Value::from(60000)));

        assert!(!topology.publication("inventory_check").unwrap().confirm);
        assert_eq!(topology.subscription("inventory_listener").unwrap().queue, "stock");
        assert_eq!(topology.subscription("inventory_listener").unwrap().prefetch, 50);
    }

    #[test]
    fn test_invalid_number_uses_default() {
        let config = Config::from_lookup(lookup(&[("PREFETCH_COUNT", "lots")])).unwrap();
        assert_eq!(config.topology.subscription("inventory_listener").unwrap().prefetch, 10);
    }

    #[test]
    fn test_zero_prefetch_is_fatal() {
        let result = Config::from_lookup(lookup(&[("PREFETCH_COUNT", "0")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name: "PREFETCH_COUNT", .. })
        ));
    }

    #[test]
    fn test_mandatory_publication_without_confirm_keeps_confirm_channel() {
        let config = Config::from_lookup(lookup(&[("PUBLISH_CONFIRM", "false")])).unwrap();

        let publication = config.topology.publication("inventory_check").unwrap();
        assert!(!publication.confirm);
        assert!(publication.uses_confirm_channel());
        assert!(config.topology.requires_confirms());
    }

    #[test]
    fn test_empty_host_is_fatal() {
        let result = Config::from_lookup(lookup(&[("AMQP_HOST", "")]));
        assert!(matches!(result, Err(ConfigError::MissingParameter("AMQP_HOST"))));
    }

    #[test]
    fn test_empty_user_is_fatal() {
        let result = Config::from_lookup(lookup(&[("AMQP_USER", "")]));
        assert!(matches!(result, Err(ConfigError::MissingParameter("AMQP_USER"))));
    }

    #[test]
    fn test_malformed_queue_arguments_are_fatal() {
        let result = Config::from_lookup(lookup(&[("QUEUE_ARGUMENTS", "[1,2]")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name: "QUEUE_ARGUMENTS", .. })
        ));
    }

    #[test]
    fn test_parse_bool_variants() {
        let vars = lookup(&[("A", "ON"), ("B", "0"), ("C", "maybe")]);
        assert!(parse_bool(&vars, "A", false));
        assert!(!parse_bool(&vars, "B", true));
        assert!(parse_bool(&vars, "C", true));
        assert!(!parse_bool(&vars, "MISSING", false));
    }
}
