//! Feature CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::RequiredMetadata;
use crate::STREAMING_KIND;

pub type Feature = FeatureCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Feature resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "FeatureCRD",
    status = "FeatureStatus",
    group = "k8s.raptor.ml",
    version = "v1alpha1",
    kind = "Feature",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "ft",
    printcolumn = r#"{"name":"Builder","type":"string","jsonPath":".spec.builder.kind"}"#,
    printcolumn = r#"{"name":"Keys","type":"string","jsonPath":".spec.keys"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSpec {
    /// The fields of an incoming row which identify the entity this feature is computed for.
    #[serde(default)]
    pub keys: Vec<String>,
    /// The builder of this feature.
    pub builder: FeatureBuilder,
}

/// The builder definition of a Feature.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureBuilder {
    /// The extraction kind of this builder. Only `streaming` builders are run by the streaming runner.
    pub kind: String,
    /// The source code of the feature program.
    #[serde(default)]
    pub code: String,
    /// Dependency packages required by the program.
    #[serde(default)]
    pub packages: Vec<String>,
    /// The schema of the messages this feature consumes.
    ///
    /// This may be an absolute schema locator, or a bare message type name resolved against the
    /// connector's schema. When omitted, the connector's schema is used.
    #[serde(default)]
    pub schema: Option<String>,
    /// The runtime environment in which the program should be executed.
    #[serde(default)]
    pub runtime: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct FeatureStatus {}

impl FeatureCRD {
    /// The fully qualified name of this feature, formatted as `{name}.{namespace}`.
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.name(), self.namespace())
    }

    /// Check if this feature's builder is of the streaming kind.
    pub fn is_streaming(&self) -> bool {
        self.spec.builder.kind.eq_ignore_ascii_case(STREAMING_KIND)
    }
}
