//! Kafka broker.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::ClientConfig;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{non_empty, timestamp_from_millis, Broker, BrokerConfig, BrokerContext, ConnectorIdentity, Message, Metadata, Subscription, SubscriptionError};
use runner_core::config::ParsedConfig;
use runner_core::AppError;

/// The broker kind name of Kafka.
pub const KIND: &str = "kafka";
/// The client ID used when none is configured.
pub const DEFAULT_CLIENT_ID: &str = "consumer.k8s.raptor.ml";
/// The oldest protocol version supported by the consumer.
const MIN_VERSION: KafkaVersion = KafkaVersion([0, 10, 0, 0]);

/// Kafka connector configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KafkaConfig {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Defaults to `{connector}.{namespace}`.
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,

    #[serde(default)]
    pub tls_disable: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// PEM encoded CA certificate.
    #[serde(default)]
    pub tls_ca_cert: Option<String>,
    /// PEM encoded client certificate.
    #[serde(default)]
    pub tls_client_cert: Option<String>,
    /// PEM encoded client key.
    #[serde(default)]
    pub tls_client_key: Option<String>,

    /// Either `oldest` or `newest`, defaulting to `newest`.
    #[serde(default)]
    pub initial_offset: Option<String>,
    /// The Kafka protocol version of the cluster, e.g. `2.8.0`.
    #[serde(default)]
    pub version: Option<String>,
}

impl KafkaConfig {
    /// Parse and validate a Kafka config.
    pub fn parse(identity: &ConnectorIdentity, config: &ParsedConfig) -> Result<Self, AppError> {
        let mut cfg: Self = config.deserialize()?;
        cfg.brokers.retain(|val| !val.trim().is_empty());
        cfg.topics.retain(|val| !val.trim().is_empty());
        if cfg.brokers.is_empty() {
            return Err(AppError::InvalidConfig("brokers required to connect to kafka".into()));
        }
        if cfg.topics.is_empty() {
            return Err(AppError::InvalidConfig("topics required to connect to kafka".into()));
        }
        if non_empty(&cfg.consumer_group).is_none() {
            cfg.consumer_group = Some(identity.to_string());
        }
        if non_empty(&cfg.client_id).is_none() {
            cfg.client_id = Some(DEFAULT_CLIENT_ID.into());
        }
        Ok(cfg)
    }

    /// Build the librdkafka client settings of this config.
    pub fn client_settings(&self) -> Result<BTreeMap<&'static str, String>, AppError> {
        let mut settings = BTreeMap::new();
        settings.insert("bootstrap.servers", self.brokers.join(","));
        settings.insert("group.id", non_empty(&self.consumer_group).unwrap_or_default().to_string());
        settings.insert("client.id", non_empty(&self.client_id).unwrap_or(DEFAULT_CLIENT_ID).to_string());
        settings.insert("auto.offset.reset", parse_initial_offset(self.initial_offset.as_deref().unwrap_or_default())?.into());
        // Offsets are stored on ack and committed in the background.
        settings.insert("enable.auto.commit", "true".into());
        settings.insert("enable.auto.offset.store", "false".into());

        if let Some(version) = non_empty(&self.version) {
            let version: KafkaVersion = version.parse()?;
            if version < MIN_VERSION {
                return Err(AppError::InvalidConfig(format!("kafka version {} is not supported", version)));
            }
            settings.insert("api.version.request", "true".into());
            settings.insert("broker.version.fallback", version.to_string());
        }

        let sasl = match (non_empty(&self.sasl_username), non_empty(&self.sasl_password)) {
            (Some(username), Some(password)) => {
                settings.insert("sasl.mechanisms", "PLAIN".into());
                settings.insert("sasl.username", username.into());
                settings.insert("sasl.password", password.into());
                true
            }
            _ => false,
        };

        let protocol = match (self.tls_disable, sasl) {
            (true, false) => "plaintext",
            (true, true) => "sasl_plaintext",
            (false, false) => "ssl",
            (false, true) => "sasl_ssl",
        };
        settings.insert("security.protocol", protocol.into());
        if !self.tls_disable {
            if self.tls_skip_verify {
                settings.insert("enable.ssl.certificate.verification", "false".into());
            }
            if let Some(ca) = non_empty(&self.tls_ca_cert) {
                settings.insert("ssl.ca.pem", ca.into());
            }
            if let Some(cert) = non_empty(&self.tls_client_cert) {
                settings.insert("ssl.certificate.pem", cert.into());
            }
            if let Some(key) = non_empty(&self.tls_client_key) {
                settings.insert("ssl.key.pem", key.into());
            }
        }
        Ok(settings)
    }
}

/// Map the configured initial offset onto librdkafka's `auto.offset.reset`.
fn parse_initial_offset(val: &str) -> Result<&'static str, AppError> {
    if val.is_empty() || val.eq_ignore_ascii_case("newest") {
        Ok("latest")
    } else if val.eq_ignore_ascii_case("oldest") {
        Ok("earliest")
    } else {
        Err(AppError::InvalidConfig(format!("invalid kafka initialOffset: {}", val)))
    }
}

/// A dotted Kafka protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KafkaVersion([u32; 4]);

impl std::str::FromStr for KafkaVersion {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InvalidConfig(format!("failed to parse kafka version: {}", s));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(invalid());
        }
        let mut out = [0u32; 4];
        for (idx, part) in parts.into_iter().enumerate() {
            out[idx] = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl std::fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [major, minor, patch, build] = self.0;
        if major == 0 {
            write!(f, "{}.{}.{}.{}", major, minor, patch, build)
        } else {
            write!(f, "{}.{}.{}", major, minor, patch)
        }
    }
}

/// The native representation of a message delivered by Kafka.
#[derive(Clone, Debug, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Message timestamp in unix milliseconds, if any.
    pub timestamp_millis: Option<i64>,
}

/// The Kafka broker.
#[derive(Default)]
pub struct KafkaBroker;

#[async_trait::async_trait]
impl Broker for KafkaBroker {
    fn parse_config(&self, identity: &ConnectorIdentity, config: &ParsedConfig) -> Result<BrokerConfig, AppError> {
        let cfg = KafkaConfig::parse(identity, config)?;
        // Surface settings errors at parse time rather than at subscribe time.
        cfg.client_settings()?;
        Ok(BrokerConfig::Kafka(cfg))
    }

    async fn subscribe(&self, config: BrokerConfig, token: CancellationToken) -> Result<(BrokerContext, Arc<dyn Subscription>)> {
        let cfg = match config {
            BrokerConfig::Kafka(cfg) => cfg,
            other => anyhow::bail!("kafka broker given non-kafka config: {:?}", other),
        };
        let mut client_config = ClientConfig::new();
        for (key, val) in cfg.client_settings()? {
            client_config.set(key, val);
        }
        let consumer: StreamConsumer = client_config.create().context("error creating kafka consumer")?;
        let topics: Vec<&str> = cfg.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).context("error subscribing to kafka topics")?;
        tracing::info!(topics = ?cfg.topics, group = ?cfg.consumer_group, "kafka subscription opened");

        let consumer = Arc::new(consumer);
        let watcher_consumer = consumer.clone();
        let watcher_token = token.clone();
        tokio::spawn(async move {
            watcher_token.cancelled().await;
            watcher_consumer.unsubscribe();
        });

        let ctx = BrokerContext {
            topic: cfg.topics.first().cloned(),
        };
        Ok((
            ctx,
            Arc::new(KafkaSubscription {
                consumer,
                offsets: Mutex::new(OffsetTracker::default()),
                token,
            }),
        ))
    }

    fn metadata(&self, ctx: &BrokerContext, msg: &Message) -> Metadata {
        match msg.native::<KafkaRecord>() {
            Some(record) => Metadata {
                topic: record.topic.clone(),
                timestamp: record.timestamp_millis.and_then(timestamp_from_millis),
                id: record.offset.to_string(),
            },
            None => Metadata {
                topic: ctx.topic.clone().unwrap_or_default(),
                timestamp: None,
                id: String::new(),
            },
        }
    }
}

/// Tracks the delivered and acknowledged offsets of each partition.
///
/// Workers acknowledge messages in any order, but a partition's committed offset may only move
/// past offsets which have all been acknowledged.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    acked: BTreeSet<i64>,
}

impl OffsetTracker {
    /// Record the delivery of the given offset.
    pub fn deliver(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions.entry((topic.to_string(), partition)).or_default().in_flight.insert(offset);
    }

    /// Record the acknowledgement of the given offset.
    ///
    /// Returns the next offset to be consumed from the partition when the acknowledgement
    /// completes a contiguous prefix of its delivered offsets.
    pub fn ack(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !offsets.in_flight.contains(&offset) {
            return None;
        }
        offsets.acked.insert(offset);

        let mut committable = None;
        while let Some(lowest) = offsets.in_flight.iter().next().copied() {
            if !offsets.acked.remove(&lowest) {
                break;
            }
            offsets.in_flight.remove(&lowest);
            committable = Some(lowest + 1);
        }
        committable
    }
}

/// A Kafka consumer group subscription.
struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    offsets: Mutex<OffsetTracker>,
    token: CancellationToken,
}

impl KafkaSubscription {
    fn offsets(&self) -> std::sync::MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait::async_trait]
impl Subscription for KafkaSubscription {
    async fn receive(&self) -> Result<Message, SubscriptionError> {
        let msg = tokio::select! {
            _ = self.token.cancelled() => return Err(SubscriptionError::Cancelled),
            msg = self.consumer.recv() => msg.context("error receiving kafka message")?,
        };
        let record = KafkaRecord {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp_millis: msg.timestamp().to_millis(),
        };
        self.offsets().deliver(&record.topic, record.partition, record.offset);
        Ok(Message::new(msg.payload().unwrap_or_default().to_vec(), record))
    }

    async fn ack(&self, msg: &Message) -> Result<(), SubscriptionError> {
        let record = msg.native::<KafkaRecord>().context("message was not delivered by kafka")?;
        let next = self.offsets().ack(&record.topic, record.partition, record.offset);
        if let Some(next) = next {
            self.consumer
                .store_offset(&record.topic, record.partition, next)
                .context("error storing kafka offset")?;
        }
        Ok(())
    }

    async fn nack(&self, _msg: &Message) -> Result<(), SubscriptionError> {
        Err(SubscriptionError::NackUnsupported)
    }

    fn nackable(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> Result<(), SubscriptionError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
