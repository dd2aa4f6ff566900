//! Runner CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod data_connector;
mod feature;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use data_connector::{ConfigVar, DataConnector, DataConnectorSpec, DataConnectorStatus, SecretKeyRef};
pub use feature::{Feature, FeatureBuilder, FeatureSpec, FeatureStatus};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for DataConnector {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Feature {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

/// A reference to a namespaced resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, JsonSchema)]
pub struct ResourceReference {
    /// The name of the referenced resource.
    pub name: String,
    /// The namespace of the referenced resource.
    ///
    /// When omitted, the namespace of the referencing resource is used.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ResourceReference {
    /// Create a new reference.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Return a copy of this reference with its namespace defaulted to the given value if absent.
    pub fn in_namespace(&self, default_namespace: &str) -> Self {
        let namespace = match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => default_namespace.to_string(),
        };
        Self {
            name: self.name.clone(),
            namespace: Some(namespace),
        }
    }
}

impl std::fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => write!(f, "{}/{}", ns, self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}
