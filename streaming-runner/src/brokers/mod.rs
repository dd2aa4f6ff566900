//! Message brokers.
//!
//! A broker opens a `Subscription` from a connector's configuration and knows how to extract
//! normalized metadata from the messages it delivers.

pub mod gcppubsub;
#[cfg(test)]
mod gcppubsub_test;
pub mod kafka;
mod registry;

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use runner_core::config::ParsedConfig;
use runner_core::AppError;

pub use registry::{BrokerRegistry, RegistryError};

/// The identity of the connector on whose behalf a subscription is opened.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectorIdentity {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for ConnectorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Broker specific configuration, one variant per broker kind.
#[derive(Clone, Debug)]
pub enum BrokerConfig {
    Kafka(kafka::KafkaConfig),
    GcpPubSub(gcppubsub::PubSubConfig),
    /// Configuration of a broker which is not built into the runner, left unparsed.
    Custom(ParsedConfig),
}

/// Values established at subscribe time which are needed later for metadata extraction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BrokerContext {
    /// The topic the subscription consumes, when the broker's messages do not carry it.
    pub topic: Option<String>,
}

/// Normalized per-message envelope info.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub topic: String,
    /// The event time of the message, if the broker could determine one.
    pub timestamp: Option<OffsetDateTime>,
    pub id: String,
}

/// A message delivered by a subscription.
pub struct Message {
    /// The raw body of the message.
    pub body: Vec<u8>,
    /// The broker native representation of the message.
    native: Box<dyn Any + Send + Sync>,
}

impl Message {
    /// Create a new instance.
    pub fn new<T: Any + Send + Sync>(body: Vec<u8>, native: T) -> Self {
        Self { body, native: Box::new(native) }
    }

    /// Get the broker native representation of this message, if it is of the given type.
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.downcast_ref()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").field("body_len", &self.body.len()).finish()
    }
}

/// An error from a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscription's scope has been cancelled.
    #[error("subscription cancelled")]
    Cancelled,
    /// The subscription has been shut down.
    #[error("subscription closed")]
    Closed,
    /// Negative acknowledgement is not supported by this subscription.
    #[error("nack is not supported by this subscription")]
    NackUnsupported,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A live, at-least-once message source.
///
/// A subscription is shared by all workers of a generation, so every method must tolerate
/// concurrent callers.
#[async_trait::async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next message, waiting until one arrives.
    async fn receive(&self) -> Result<Message, SubscriptionError>;

    /// Positively acknowledge the given message.
    async fn ack(&self, msg: &Message) -> Result<(), SubscriptionError>;

    /// Negatively acknowledge the given message, requesting redelivery.
    async fn nack(&self, msg: &Message) -> Result<(), SubscriptionError>;

    /// Check if this subscription supports negative acknowledgement.
    fn nackable(&self) -> bool;

    /// Shut this subscription down, releasing its resources.
    async fn shutdown(&self) -> Result<(), SubscriptionError>;
}

/// A pluggable message source implementation.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Parse the broker specific configuration of a connector.
    fn parse_config(&self, identity: &ConnectorIdentity, config: &ParsedConfig) -> Result<BrokerConfig, AppError>;

    /// Open a subscription.
    ///
    /// All resources allocated by the subscription must be released once the given token is
    /// cancelled.
    async fn subscribe(&self, config: BrokerConfig, token: CancellationToken) -> Result<(BrokerContext, Arc<dyn Subscription>)>;

    /// Extract normalized metadata from a message delivered by this broker.
    fn metadata(&self, ctx: &BrokerContext, msg: &Message) -> Metadata;
}

/// Build the registry of all brokers built into the runner.
pub fn builtin() -> Result<BrokerRegistry, RegistryError> {
    let mut builder = BrokerRegistry::builder();
    builder.register(kafka::KIND, Arc::new(kafka::KafkaBroker::default()))?;
    builder.register(gcppubsub::KIND, Arc::new(gcppubsub::PubSubBroker::default()))?;
    Ok(builder.build())
}

/// Convert a unix timestamp in milliseconds into a timestamp, treating non-positive values as unknown.
pub(crate) fn timestamp_from_millis(millis: i64) -> Option<OffsetDateTime> {
    if millis <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

/// Return the given string if it is non-empty.
pub(crate) fn non_empty(val: &Option<String>) -> Option<&str> {
    val.as_deref().filter(|val| !val.is_empty())
}
