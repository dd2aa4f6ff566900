//! DataConnector CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceReference;

pub type DataConnector = DataConnectorCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the DataConnector resource.
///
/// A DataConnector describes a single streaming pipeline: the broker to consume from, the
/// broker-specific configuration, and (via its status) the features bound to it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "DataConnectorCRD",
    status = "DataConnectorStatus",
    group = "k8s.raptor.ml",
    version = "v1alpha1",
    kind = "DataConnector",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "conn",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataConnectorSpec {
    /// The broker kind of this connector, e.g. `kafka` or `gcp_pubsub`.
    pub kind: String,
    /// Configuration variables of this connector.
    ///
    /// This holds the common streaming settings (`workers`, `schema`) alongside the
    /// broker-specific settings.
    #[serde(default)]
    pub config: Vec<ConfigVar>,
    /// The number of runner replicas to deploy for this connector.
    #[serde(default)]
    pub replicas: Option<i32>,
}

/// A single configuration variable of a connector.
///
/// Exactly one of `value` or `secretKeyRef` is expected to be set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVar {
    /// The name of the variable.
    pub name: String,
    /// A literal value.
    #[serde(default)]
    pub value: Option<String>,
    /// A reference to a key of a Secret in the connector's namespace.
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyRef>,
}

/// A reference to a key within a Secret.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct SecretKeyRef {
    /// The name of the Secret.
    pub name: String,
    /// The key within the Secret's data.
    pub key: String,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct DataConnectorStatus {
    /// The features bound to this connector.
    #[serde(default)]
    pub features: Vec<ResourceReference>,
}

impl DataConnectorCRD {
    /// The feature references bound to this connector, if any.
    pub fn feature_refs(&self) -> &[ResourceReference] {
        self.status.as_ref().map(|status| status.features.as_slice()).unwrap_or_default()
    }
}
