//! Connector configuration parsing.
//!
//! A connector's config vars are resolved into a flat string map, which is then deserialized
//! into strongly typed config structs. Values are parsed leniently: lists are comma-separated,
//! booleans and integers are parsed from their textual form.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::AppError;

/// The resolved configuration of a connector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedConfig {
    vars: BTreeMap<String, String>,
}

impl ParsedConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, normalizing its key to `snake_case`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(normalize_key(key), value.into());
    }

    /// Get the raw value of the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(&normalize_key(key)).map(String::as_str)
    }

    /// Deserialize this config into the given typed config.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        envy::from_iter(self.vars.iter().map(|(k, v)| (k.clone(), v.clone()))).map_err(|err| AppError::InvalidConfig(err.to_string()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for ParsedConfig {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut config = Self::new();
        for (key, value) in iter {
            config.insert(key.as_ref(), value);
        }
        config
    }
}

/// Settings common to all streaming connectors, regardless of broker kind.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// The number of concurrent workers consuming the connector's subscription.
    #[serde(default = "StreamingConfig::default_workers")]
    pub workers: usize,
    /// The default schema locator of the connector's messages.
    #[serde(default)]
    pub schema: Option<String>,
}

impl StreamingConfig {
    fn default_workers() -> usize {
        1
    }

    /// Parse the streaming settings out of the given config.
    pub fn from_parsed(config: &ParsedConfig) -> Result<Self, AppError> {
        let mut out: Self = config.deserialize()?;
        if out.workers == 0 {
            out.workers = Self::default_workers();
        }
        if out.schema.as_deref().map(str::is_empty).unwrap_or(false) {
            out.schema = None;
        }
        Ok(out)
    }
}

/// Normalize a config key into `snake_case`, so that `consumerGroup`, `consumer-group` and
/// `consumer_group` all address the same value.
fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (idx, ch) in key.chars().enumerate() {
        match ch {
            '-' | '.' | ' ' => out.push('_'),
            ch if ch.is_ascii_uppercase() => {
                if idx > 0 && !out.ends_with('_') {
                    out.push('_');
                }
                out.push(ch.to_ascii_lowercase());
            }
            ch => out.push(ch),
        }
    }
    out
}
