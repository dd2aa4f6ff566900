use std::collections::HashMap;
use std::sync::Arc;

use super::Broker;

/// An error from broker registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("broker {0} is already registered")]
    Duplicate(String),
}

/// A builder of a `BrokerRegistry`.
///
/// Brokers may only be registered through the builder; once built, the registry is immutable.
#[derive(Default)]
pub struct BrokerRegistryBuilder {
    brokers: HashMap<String, Arc<dyn Broker>>,
}

impl BrokerRegistryBuilder {
    /// Register a broker under the given kind name.
    pub fn register(&mut self, name: &str, broker: Arc<dyn Broker>) -> Result<&mut Self, RegistryError> {
        if self.brokers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.into()));
        }
        tracing::debug!(broker = name, "registering broker");
        self.brokers.insert(name.into(), broker);
        Ok(self)
    }

    /// Freeze the registered brokers into a registry.
    pub fn build(self) -> BrokerRegistry {
        BrokerRegistry { brokers: self.brokers }
    }
}

/// A table of broker implementations keyed by broker kind.
pub struct BrokerRegistry {
    brokers: HashMap<String, Arc<dyn Broker>>,
}

impl BrokerRegistry {
    /// Create a new registry builder.
    pub fn builder() -> BrokerRegistryBuilder {
        BrokerRegistryBuilder::default()
    }

    /// Get the broker registered under the given kind name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Broker>> {
        self.brokers.get(name).cloned()
    }

    /// The sorted names of all registered brokers.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.brokers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
