//! Control plane access.
//!
//! Feature definitions and connector secrets are read from the K8s API on demand.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use runner_core::crd::{Feature, ResourceReference, SecretKeyRef};

/// The source of feature definitions and secret values.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the definition of the referenced feature.
    async fn get_feature(&self, reference: &ResourceReference) -> Result<Feature>;

    /// Fetch the value of the referenced secret key in the given namespace.
    async fn get_secret_value(&self, namespace: &str, reference: &SecretKeyRef) -> Result<String>;
}

/// A control plane backed by the K8s API.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ControlPlane for KubeControlPlane {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_feature(&self, reference: &ResourceReference) -> Result<Feature> {
        let namespace = reference.namespace.as_deref().unwrap_or_default();
        let api: Api<Feature> = Api::namespaced(self.client.clone(), namespace);
        api.get(&reference.name).await.with_context(|| format!("error fetching feature {}", reference))
    }

    #[tracing::instrument(level = "debug", skip(self, reference), fields(secret = %reference.name))]
    async fn get_secret_value(&self, namespace: &str, reference: &SecretKeyRef) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(&reference.name)
            .await
            .with_context(|| format!("error fetching secret {}/{}", namespace, reference.name))?;
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&reference.key))
            .with_context(|| format!("key {} not found in secret {}/{}", reference.key, namespace, reference.name))?;
        String::from_utf8(value.0.clone()).with_context(|| format!("key {} of secret {}/{} is not valid UTF-8", reference.key, namespace, reference.name))
    }
}
