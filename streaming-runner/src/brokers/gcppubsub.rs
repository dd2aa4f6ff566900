//! Google Cloud Pub/Sub broker.
//!
//! Messages are pulled over the Pub/Sub REST API by a background task which lives as long as
//! the subscription's cancellation scope. Pulled messages are leased until acknowledged: a
//! second task periodically extends the ack deadline of every outstanding message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{non_empty, Broker, BrokerConfig, BrokerContext, ConnectorIdentity, Message, Metadata, Subscription, SubscriptionError};
use runner_core::config::ParsedConfig;
use runner_core::AppError;

/// The broker kind name of Cloud Pub/Sub.
pub const KIND: &str = "gcp_pubsub";
/// The env var pointing to a default service account key file.
const ENV_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const DEFAULT_MAX_BATCH_SIZE: i32 = 100;
/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: time::Duration = time::Duration::seconds(60);
const PULL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// The ack deadline requested for outstanding messages.
const LEASE_DEADLINE_SECS: i32 = 60;
/// How often the ack deadline of outstanding messages is extended.
const LEASE_EXTENSION_INTERVAL: Duration = Duration::from_secs(20);
/// The maximum number of ack IDs per deadline extension request.
const LEASE_BATCH_SIZE: usize = 1000;

/// Cloud Pub/Sub connector configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PubSubConfig {
    pub project_id: String,
    /// The name of the subscription to consume.
    pub topic: String,
    /// A service account key in JSON form. Ambient default credentials are used when absent.
    #[serde(default)]
    pub credential_json: Option<String>,
    /// The maximum number of messages fetched per pull.
    #[serde(default)]
    pub max_batch_size: i32,
    /// An alternative API endpoint, e.g. of the Pub/Sub emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl PubSubConfig {
    /// Parse and validate a Pub/Sub config.
    pub fn parse(config: &ParsedConfig) -> Result<Self, AppError> {
        let mut cfg: Self = config.deserialize()?;
        if cfg.project_id.trim().is_empty() {
            return Err(AppError::InvalidConfig("project_id required to connect to pubsub".into()));
        }
        if cfg.topic.trim().is_empty() {
            return Err(AppError::InvalidConfig("topic required to connect to pubsub".into()));
        }
        if cfg.max_batch_size <= 0 {
            cfg.max_batch_size = DEFAULT_MAX_BATCH_SIZE;
        }
        Ok(cfg)
    }

    /// The full resource path of the subscription.
    pub fn subscription_path(&self) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, self.topic)
    }

    /// The explicitly configured credentials, if any.
    pub fn explicit_credentials(&self) -> Result<Option<CredentialSource>, AppError> {
        match non_empty(&self.credential_json) {
            Some(json) => ServiceAccountKey::from_json(json.as_bytes())
                .map(|key| Some(CredentialSource::ServiceAccount(key)))
                .map_err(|err| AppError::InvalidConfig(format!("failed to parse credential json: {}", err))),
            None => Ok(None),
        }
    }

    /// Resolve the credentials to use, falling back to the ambient default credentials.
    async fn credentials(&self) -> Result<CredentialSource> {
        if let Some(creds) = self.explicit_credentials()? {
            return Ok(creds);
        }
        if non_empty(&self.endpoint).is_some() {
            return Ok(CredentialSource::Anonymous);
        }
        match std::env::var(ENV_APPLICATION_CREDENTIALS) {
            Ok(path) if !path.is_empty() => {
                let data = tokio::fs::read(&path).await.with_context(|| format!("error reading credentials file {}", path))?;
                let key = ServiceAccountKey::from_json(&data).with_context(|| format!("error parsing credentials file {}", path))?;
                Ok(CredentialSource::ServiceAccount(key))
            }
            _ => Ok(CredentialSource::MetadataServer),
        }
    }
}

/// The source of the access tokens used to call the Pub/Sub API.
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialSource {
    /// A service account key, exchanged for tokens via a signed JWT.
    ServiceAccount(ServiceAccountKey),
    /// The GCE metadata server of the host.
    MetadataServer,
    /// No authentication, only used with an alternative endpoint.
    Anonymous,
}

/// The relevant fields of a service account key file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    fn from_json(data: &[u8]) -> Result<Self> {
        let key: Self = serde_json::from_slice(data).context("invalid service account key")?;
        if key.client_email.is_empty() || key.private_key.is_empty() {
            bail!("service account key is missing client_email or private_key");
        }
        Ok(key)
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

struct AccessToken {
    token: String,
    expires_at: OffsetDateTime,
}

/// Fetches and caches access tokens.
struct TokenProvider {
    http: reqwest::Client,
    source: CredentialSource,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenProvider {
    /// Get a valid access token, refreshing it as needed.
    async fn token(&self) -> Result<Option<String>> {
        if self.source == CredentialSource::Anonymous {
            return Ok(None);
        }
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - TOKEN_EXPIRY_MARGIN > OffsetDateTime::now_utc() {
                return Ok(Some(token.token.clone()));
            }
        }
        let resp = self.fetch().await?;
        let token = resp.access_token.clone();
        *cached = Some(AccessToken {
            token: resp.access_token,
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(resp.expires_in.max(0)),
        });
        Ok(Some(token))
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let req = match &self.source {
            CredentialSource::ServiceAccount(key) => {
                let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let now = OffsetDateTime::now_utc().unix_timestamp();
                let claims = JwtClaims {
                    iss: &key.client_email,
                    scope: PUBSUB_SCOPE,
                    aud: token_uri,
                    iat: now,
                    exp: now + 3600,
                };
                let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).context("invalid service account private key")?;
                let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key).context("error signing token request")?;
                self.http
                    .post(token_uri)
                    .form(&[("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"), ("assertion", assertion.as_str())])
            }
            CredentialSource::MetadataServer => self.http.get(METADATA_TOKEN_URL).header("Metadata-Flavor", "Google"),
            CredentialSource::Anonymous => bail!("anonymous credentials have no token"),
        };
        req.send()
            .await
            .context("error requesting access token")?
            .error_for_status()
            .context("access token request rejected")?
            .json()
            .await
            .context("error decoding access token response")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: i32,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

/// A message as returned by a pull.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
}

/// The payload of a pulled message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    /// Base64 encoded message data.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub publish_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: i32,
}

/// The native representation of a message delivered by Pub/Sub.
#[derive(Clone, Debug, PartialEq)]
pub struct PubSubRecord {
    pub ack_id: String,
    pub message_id: String,
    pub publish_time: Option<OffsetDateTime>,
    pub attributes: HashMap<String, String>,
}

impl ReceivedMessage {
    /// Decode this pulled message into a runner message.
    pub fn into_message(self) -> Result<Message> {
        let body = base64::decode(&self.message.data).context("invalid base64 message data")?;
        let publish_time = match self.message.publish_time.as_deref() {
            Some(ts) => Some(OffsetDateTime::parse(ts, &Rfc3339).with_context(|| format!("invalid message publish time {}", ts))?),
            None => None,
        };
        let record = PubSubRecord {
            ack_id: self.ack_id,
            message_id: self.message.message_id,
            publish_time,
            attributes: self.message.attributes,
        };
        Ok(Message::new(body, record))
    }
}

/// The ack IDs of messages pulled but not yet acknowledged.
#[derive(Debug, Default)]
pub struct Leases {
    held: std::sync::Mutex<HashSet<String>>,
}

impl Leases {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Hold the lease of the given message.
    pub fn hold(&self, ack_id: &str) {
        self.lock().insert(ack_id.to_string());
    }

    /// Release the lease of the given message.
    pub fn release(&self, ack_id: &str) {
        self.lock().remove(ack_id);
    }

    /// The ack IDs of all held leases, sorted.
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<_> = self.lock().iter().cloned().collect();
        held.sort_unstable();
        held
    }
}

/// A minimal Pub/Sub subscriber API client.
struct PubSubClient {
    http: reqwest::Client,
    base: String,
    subscription: String,
    tokens: TokenProvider,
    leases: Leases,
}

impl PubSubClient {
    fn url(&self, action: &str) -> String {
        format!("{}/{}{}", self.base.trim_end_matches('/'), self.subscription, action)
    }

    async fn request(&self, method: reqwest::Method, url: String) -> Result<reqwest::RequestBuilder> {
        let req = self.http.request(method, url);
        Ok(match self.tokens.token().await? {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }

    /// Check that the subscription exists and is accessible.
    async fn check(&self) -> Result<()> {
        self.request(reqwest::Method::GET, self.url(""))
            .await?
            .send()
            .await
            .context("error connecting to pubsub")?
            .error_for_status()
            .with_context(|| format!("error fetching pubsub subscription {}", self.subscription))?;
        Ok(())
    }

    async fn pull(&self, max_messages: i32) -> Result<Vec<ReceivedMessage>> {
        let resp: PullResponse = self
            .request(reqwest::Method::POST, self.url(":pull"))
            .await?
            .json(&PullRequest { max_messages })
            .send()
            .await
            .context("error pulling pubsub messages")?
            .error_for_status()
            .context("pubsub pull rejected")?
            .json()
            .await
            .context("error decoding pubsub pull response")?;
        Ok(resp.received_messages)
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<()> {
        self.request(reqwest::Method::POST, self.url(":acknowledge"))
            .await?
            .json(&AckRequest { ack_ids: [ack_id] })
            .send()
            .await
            .context("error acknowledging pubsub message")?
            .error_for_status()
            .context("pubsub acknowledge rejected")?;
        Ok(())
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], seconds: i32) -> Result<()> {
        self.request(reqwest::Method::POST, self.url(":modifyAckDeadline"))
            .await?
            .json(&ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds: seconds,
            })
            .send()
            .await
            .context("error modifying pubsub ack deadline")?
            .error_for_status()
            .context("pubsub modify ack deadline rejected")?;
        Ok(())
    }
}

/// The Cloud Pub/Sub broker.
#[derive(Default)]
pub struct PubSubBroker;

#[async_trait::async_trait]
impl Broker for PubSubBroker {
    fn parse_config(&self, _identity: &ConnectorIdentity, config: &ParsedConfig) -> Result<BrokerConfig, AppError> {
        let cfg = PubSubConfig::parse(config)?;
        cfg.explicit_credentials()?;
        Ok(BrokerConfig::GcpPubSub(cfg))
    }

    async fn subscribe(&self, config: BrokerConfig, token: CancellationToken) -> Result<(BrokerContext, Arc<dyn Subscription>)> {
        let cfg = match config {
            BrokerConfig::GcpPubSub(cfg) => cfg,
            other => bail!("pubsub broker given non-pubsub config: {:?}", other),
        };
        let http = reqwest::Client::builder().build().context("error building pubsub http client")?;
        let client = Arc::new(PubSubClient {
            tokens: TokenProvider {
                http: http.clone(),
                source: cfg.credentials().await?,
                cached: Mutex::new(None),
            },
            http,
            base: non_empty(&cfg.endpoint).unwrap_or(DEFAULT_ENDPOINT).to_string(),
            subscription: cfg.subscription_path(),
            leases: Leases::default(),
        });
        client.check().await?;
        tracing::info!(subscription = %client.subscription, "pubsub subscription opened");

        let token = token.child_token();
        let (tx, rx) = mpsc::channel(cfg.max_batch_size as usize);
        tokio::spawn(pull_loop(client.clone(), tx, token.clone(), cfg.max_batch_size));
        tokio::spawn(lease_loop(client.clone(), token.clone()));

        let ctx = BrokerContext {
            topic: Some(cfg.topic.clone()),
        };
        Ok((ctx, Arc::new(PubSubSubscription { client, rx: Mutex::new(rx), token })))
    }

    fn metadata(&self, ctx: &BrokerContext, msg: &Message) -> Metadata {
        let record = msg.native::<PubSubRecord>();
        Metadata {
            topic: ctx.topic.clone().unwrap_or_default(),
            timestamp: record.and_then(|record| record.publish_time),
            id: record.map(|record| record.message_id.clone()).unwrap_or_default(),
        }
    }
}

/// Pull messages into the given channel until the token is cancelled.
async fn pull_loop(client: Arc<PubSubClient>, tx: mpsc::Sender<Message>, token: CancellationToken, max_messages: i32) {
    loop {
        let res = tokio::select! {
            _ = token.cancelled() => break,
            res = client.pull(max_messages) => res,
        };
        let received = match res {
            Ok(received) => received,
            Err(err) => {
                tracing::error!(error = ?err, subscription = %client.subscription, "error pulling pubsub messages");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(PULL_RETRY_DELAY) => continue,
                }
            }
        };
        for received in received {
            let ack_id = received.ack_id.clone();
            let msg = match received.into_message() {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!(error = ?err, "dropping undecodable pubsub message");
                    if let Err(err) = client.acknowledge(&ack_id).await {
                        tracing::error!(error = ?err, "error acknowledging undecodable pubsub message");
                    }
                    continue;
                }
            };
            client.leases.hold(&ack_id);
            tokio::select! {
                _ = token.cancelled() => return,
                res = tx.send(msg) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
    tracing::debug!(subscription = %client.subscription, "pubsub pull loop stopped");
}

/// Extend the ack deadline of all outstanding messages until the token is cancelled.
async fn lease_loop(client: Arc<PubSubClient>, token: CancellationToken) {
    let mut interval = tokio::time::interval(LEASE_EXTENSION_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => (),
        }
        let held = client.leases.held();
        for batch in held.chunks(LEASE_BATCH_SIZE) {
            if let Err(err) = client.modify_ack_deadline(batch, LEASE_DEADLINE_SECS).await {
                tracing::error!(error = ?err, leases = batch.len(), "error extending pubsub message leases");
            }
        }
    }
    tracing::debug!(subscription = %client.subscription, "pubsub lease loop stopped");
}

/// A Cloud Pub/Sub subscription.
struct PubSubSubscription {
    client: Arc<PubSubClient>,
    rx: Mutex<mpsc::Receiver<Message>>,
    token: CancellationToken,
}

impl PubSubSubscription {
    fn record<'a>(&self, msg: &'a Message) -> Result<&'a PubSubRecord, SubscriptionError> {
        Ok(msg.native::<PubSubRecord>().context("message was not delivered by pubsub")?)
    }
}

#[async_trait::async_trait]
impl Subscription for PubSubSubscription {
    async fn receive(&self) -> Result<Message, SubscriptionError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.token.cancelled() => Err(SubscriptionError::Cancelled),
            msg = rx.recv() => msg.ok_or(SubscriptionError::Closed),
        }
    }

    async fn ack(&self, msg: &Message) -> Result<(), SubscriptionError> {
        let record = self.record(msg)?;
        let res = self.client.acknowledge(&record.ack_id).await;
        self.client.leases.release(&record.ack_id);
        Ok(res?)
    }

    async fn nack(&self, msg: &Message) -> Result<(), SubscriptionError> {
        let record = self.record(msg)?;
        self.client.leases.release(&record.ack_id);
        Ok(self.client.modify_ack_deadline(&[record.ack_id.clone()], 0).await?)
    }

    fn nackable(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> Result<(), SubscriptionError> {
        self.token.cancel();
        Ok(())
    }
}
