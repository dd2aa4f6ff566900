//! Schema resolution.
//!
//! Schemas are `.proto` files addressed by a locator URL, whose fragment names a message type,
//! e.g. `https://example.com/schemas/clicks.proto#Click`. A registered file's messages are
//! indexed by fully qualified name and used to decode binary message bodies into rows.


use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use protobuf::reflect::{FileDescriptor, MessageDescriptor};
use protobuf::CodedInputStream;
use protobuf_json_mapping::PrintOptions;
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use crate::utils::{self, Row};

const DEFAULT_FILE_NAME: &str = "schema.proto";

/// An error from the schema subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid schema reference {0:?}")]
    InvalidReference(String),
    #[error("error fetching schema {locator}: {source}")]
    Fetch { locator: String, source: anyhow::Error },
    #[error("error parsing schema {locator}: {reason}")]
    Parse { locator: String, reason: String },
    #[error("message type {message} is already registered with a different definition (from {existing})")]
    Conflict { message: String, existing: String },
    #[error("schema type {0} was not found")]
    NotFound(String),
    #[error("error decoding message as {message}: {reason}")]
    Decode { message: String, reason: String },
}

/// A reference to a schema message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaRef {
    /// A locator whose fragment names the message type.
    Absolute { locator: Url, message: String },
    /// A bare message type name, resolved against the connector's schema.
    Relative(String),
}

impl SchemaRef {
    /// Parse the given schema reference.
    pub fn parse(val: &str) -> Result<Self, SchemaError> {
        let val = val.trim();
        let invalid = || SchemaError::InvalidReference(val.to_string());
        if val.is_empty() {
            return Err(invalid());
        }
        match Url::parse(val) {
            Ok(url) if url.has_host() => {
                let message = url.fragment().unwrap_or_default().to_string();
                let mut locator = url;
                locator.set_fragment(None);
                Ok(Self::Absolute { locator, message })
            }
            Ok(_) => Err(invalid()),
            Err(_) => {
                let is_name = val.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
                if is_name {
                    Ok(Self::Relative(val.to_string()))
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

/// Qualify a message name with the given package if the name is not already qualified.
pub fn qualify(name: &str, package: &str) -> String {
    if name.contains('.') || package.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", package, name)
    }
}

/// A message type bound to the locator it is defined by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundSchema {
    pub locator: Url,
    /// The fully qualified message name.
    pub message: String,
}

/// The default schema of a connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorSchema {
    pub locator: Url,
    /// The package registered for the locator.
    pub package: String,
    /// The fully qualified message name from the locator's fragment, if any.
    pub message: Option<String>,
}

impl ConnectorSchema {
    /// The schema bound by this connector schema, if it names a message type.
    pub fn bound(&self) -> Option<BoundSchema> {
        self.message.as_ref().map(|message| BoundSchema {
            locator: self.locator.clone(),
            message: message.clone(),
        })
    }
}

/// A source of `.proto` files.
#[async_trait::async_trait]
pub trait SchemaFetcher: Send + Sync {
    /// Fetch the source of the `.proto` file at the given locator.
    async fn fetch(&self, locator: &Url) -> anyhow::Result<String>;
}

/// A fetcher of `.proto` files over HTTP.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl SchemaFetcher for HttpFetcher {
    async fn fetch(&self, locator: &Url) -> anyhow::Result<String> {
        self.client
            .get(locator.clone())
            .send()
            .await
            .context("error requesting schema")?
            .error_for_status()
            .context("schema request rejected")?
            .text()
            .await
            .context("error reading schema body")
    }
}

/// A registered message type, along with the locator which first defined it.
struct Registered {
    locator: String,
    descriptor: MessageDescriptor,
}

#[derive(Default)]
struct Inner {
    /// Registered locators, mapped to their package.
    locators: HashMap<String, String>,
    /// All known message types by fully qualified name.
    messages: HashMap<String, Registered>,
}

/// A process-wide registry of schema message types.
///
/// Safe for concurrent registration and lookup.
pub struct SchemaRegistry {
    fetcher: Arc<dyn SchemaFetcher>,
    inner: RwLock<Inner>,
}

impl SchemaRegistry {
    /// Create a new instance.
    pub fn new(fetcher: Arc<dyn SchemaFetcher>) -> Self {
        Self {
            fetcher,
            inner: Default::default(),
        }
    }

    /// Register the schema file at the given locator, returning its package name.
    ///
    /// Registering a locator which is already registered is a no-op. Files may share a package,
    /// but a message type may only be defined once: redefining a known type differently is a
    /// conflict, in which case none of the file's types are registered.
    #[tracing::instrument(level = "debug", skip(self, locator), fields(locator = %locator))]
    pub async fn register(&self, locator: &Url) -> Result<String, SchemaError> {
        let mut locator = locator.clone();
        locator.set_fragment(None);
        let key = locator.to_string();
        if let Some(package) = self.inner.read().await.locators.get(&key) {
            return Ok(package.clone());
        }

        let source = self
            .fetcher
            .fetch(&locator)
            .await
            .map_err(|source| SchemaError::Fetch { locator: key.clone(), source })?;
        let (package, messages) = parse_schema(&locator, &source)?;

        let mut inner = self.inner.write().await;
        if let Some(package) = inner.locators.get(&key) {
            return Ok(package.clone());
        }
        let mut added = Vec::with_capacity(messages.len());
        for msg in messages {
            match inner.messages.get(msg.full_name()) {
                Some(existing) if existing.descriptor.proto() != msg.proto() => {
                    return Err(SchemaError::Conflict {
                        message: msg.full_name().to_string(),
                        existing: existing.locator.clone(),
                    });
                }
                Some(_) => continue,
                None => added.push(msg),
            }
        }
        tracing::debug!(%package, messages = added.len(), "registered schema");
        for msg in added {
            let registered = Registered {
                locator: key.clone(),
                descriptor: msg.clone(),
            };
            inner.messages.insert(msg.full_name().to_string(), registered);
        }
        inner.locators.insert(key, package.clone());
        Ok(package)
    }

    /// Resolve the given fully qualified message type.
    pub async fn resolve(&self, name: &str) -> Result<MessageDescriptor, SchemaError> {
        self.inner
            .read()
            .await
            .messages
            .get(name)
            .map(|registered| registered.descriptor.clone())
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))
    }

    /// Resolve the given bound schema, registering its locator once if the type is not yet known.
    pub async fn resolve_or_register(&self, schema: &BoundSchema) -> Result<MessageDescriptor, SchemaError> {
        match self.resolve(&schema.message).await {
            Err(SchemaError::NotFound(_)) => {
                self.register(&schema.locator).await?;
                self.resolve(&schema.message).await
            }
            res => res,
        }
    }

    /// Register the connector default schema from the given reference.
    pub async fn connector_schema(&self, reference: &str) -> Result<ConnectorSchema, SchemaError> {
        match SchemaRef::parse(reference)? {
            SchemaRef::Absolute { locator, message } => {
                let package = self.register(&locator).await?;
                let message = (!message.is_empty()).then(|| qualify(&message, &package));
                Ok(ConnectorSchema { locator, package, message })
            }
            SchemaRef::Relative(_) => Err(SchemaError::InvalidReference(reference.to_string())),
        }
    }

    /// Bind the given schema reference to a message type, registering its locator as needed.
    ///
    /// Relative references are resolved against the given connector schema.
    pub async fn bind(&self, reference: &str, default: Option<&ConnectorSchema>) -> Result<BoundSchema, SchemaError> {
        match SchemaRef::parse(reference)? {
            SchemaRef::Absolute { message, .. } if message.is_empty() => Err(SchemaError::InvalidReference(reference.to_string())),
            SchemaRef::Absolute { locator, message } => {
                let package = self.register(&locator).await?;
                Ok(BoundSchema {
                    message: qualify(&message, &package),
                    locator,
                })
            }
            SchemaRef::Relative(name) => match default {
                Some(default) => Ok(BoundSchema {
                    locator: default.locator.clone(),
                    message: qualify(&name, &default.package),
                }),
                None => Err(SchemaError::InvalidReference(reference.to_string())),
            },
        }
    }
}

/// Parse a `.proto` source into its package name and all of its message types.
fn parse_schema(locator: &Url, source: &str) -> Result<(String, Vec<MessageDescriptor>), SchemaError> {
    let parse_err = |reason: String| SchemaError::Parse {
        locator: locator.to_string(),
        reason,
    };
    let file_name = locator
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| name.ends_with(".proto"))
        .unwrap_or(DEFAULT_FILE_NAME)
        .to_string();

    let tmp = tempfile::tempdir().map_err(|err| parse_err(err.to_string()))?;
    let path = tmp.path().join(&file_name);
    std::fs::write(&path, source.as_bytes()).map_err(|err| parse_err(err.to_string()))?;
    let parsed = protobuf_parse::Parser::new()
        .pure()
        .includes(&[tmp.path().to_path_buf()])
        .input(&path)
        .parse_and_typecheck()
        .map_err(|err| parse_err(format!("{:#}", err)))?;

    let files = FileDescriptor::new_dynamic_fds(parsed.file_descriptors, &[]).map_err(|err| parse_err(err.to_string()))?;
    let package = files
        .iter()
        .find(|file| file.proto().name() == file_name)
        .map(|file| file.package().to_string())
        .ok_or_else(|| parse_err(format!("file {} missing from parsed output", file_name)))?;

    let mut messages = vec![];
    let mut pending: Vec<MessageDescriptor> = files.iter().flat_map(|file| file.messages()).collect();
    while let Some(msg) = pending.pop() {
        pending.extend(msg.nested_messages());
        messages.push(msg);
    }
    Ok((package, messages))
}

/// Decode a binary message of the given type into a flattened row.
///
/// Fields holding their default value are omitted from the row, as are unset message fields.
pub fn decode(descriptor: &MessageDescriptor, body: &[u8]) -> Result<Row, SchemaError> {
    let decode_err = |reason: String| SchemaError::Decode {
        message: descriptor.full_name().to_string(),
        reason,
    };
    let mut msg = descriptor.new_instance();
    msg.merge_from_dyn(&mut CodedInputStream::from_bytes(body)).map_err(|err| decode_err(err.to_string()))?;

    let opts = PrintOptions {
        enum_values_int: false,
        proto_field_name: false,
        always_output_default_values: false,
        ..Default::default()
    };
    let json = protobuf_json_mapping::print_to_string_with_options(&*msg, &opts).map_err(|err| decode_err(err.to_string()))?;
    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(obj)) => Ok(utils::flatten(obj)),
        Ok(_) => Err(decode_err("message did not encode as a JSON object".into())),
        Err(err) => Err(decode_err(err.to_string())),
    }
}
