//! Calls into the platform collaborators: the policy catalog, cross-cluster
//! sync, storage bootstrap and app-group bookkeeping.
//!
//! Every call is one-way. Only success or failure is observed, and only for
//! logging inside scheduled tasks.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};
use crate::resources::custom::VirtualClusterPolicy;

/// Ingress lifecycle event forwarded to the gateway sync.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum IngressEvent {
    Added { ingress: Box<Ingress> },
    Updated { old: Box<Ingress>, new: Box<Ingress> },
    Deleted { ingress: Box<Ingress> },
}

impl IngressEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IngressEvent::Added { .. } => "added",
            IngressEvent::Updated { .. } => "updated",
            IngressEvent::Deleted { .. } => "deleted",
        }
    }
}

#[async_trait]
pub trait PlatformHooks: Send + Sync {
    /// Publish policy metadata to the external catalog
    async fn publish_policy(&self, policy: &VirtualClusterPolicy) -> Result<()>;
    async fn sync_ingress(&self, event: &IngressEvent) -> Result<()>;
    /// Forward an object from a tenant cluster to its parent
    async fn sync_to_parent(&self, kind: &str, object: &Value) -> Result<()>;
    /// Fan a root-cluster secret out to tenant clusters
    async fn sync_secret_to_tenants(&self, secret: &Secret) -> Result<()>;
    async fn storage_node_ready(&self, node: &str) -> Result<()>;
    async fn storage_replicas_changed(&self, namespace: &str, volume: &str) -> Result<()>;
    async fn storage_overselling(&self, percentage: &str) -> Result<()>;
    async fn delete_app_group(&self, namespace: &str, name: &str) -> Result<()>;
    async fn sync_mcp_bridge(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Hooks delivered as JSON POSTs to `{endpoint}/hooks/{event}`.
#[derive(Clone)]
pub struct HttpPlatformHooks {
    endpoint: Option<String>,
    http: reqwest::Client,
}

impl HttpPlatformHooks {
    pub fn new(endpoint: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { endpoint, http })
    }

    async fn post(&self, event: &str, body: Value) -> Result<()> {
        let Some(endpoint) = &self.endpoint else {
            debug!(event, "No platform endpoint configured, skipping hook");
            return Ok(());
        };
        let url = format!("{}/hooks/{}", endpoint, event);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Hook(format!("{} returned {}: {}", url, status, text)));
        }
        debug!(event, "Delivered platform hook");
        Ok(())
    }
}

#[async_trait]
impl PlatformHooks for HttpPlatformHooks {
    async fn publish_policy(&self, policy: &VirtualClusterPolicy) -> Result<()> {
        self.post("publish-policy", serde_json::to_value(policy)?).await
    }

    async fn sync_ingress(&self, event: &IngressEvent) -> Result<()> {
        self.post("sync-ingress", serde_json::to_value(event)?).await
    }

    async fn sync_to_parent(&self, kind: &str, object: &Value) -> Result<()> {
        self.post("sync-to-parent", json!({"kind": kind, "object": object}))
            .await
    }

    async fn sync_secret_to_tenants(&self, secret: &Secret) -> Result<()> {
        self.post("sync-secret", serde_json::to_value(secret)?).await
    }

    async fn storage_node_ready(&self, node: &str) -> Result<()> {
        self.post("storage-node-ready", json!({"node": node})).await
    }

    async fn storage_replicas_changed(&self, namespace: &str, volume: &str) -> Result<()> {
        self.post(
            "storage-replicas-changed",
            json!({"namespace": namespace, "volume": volume}),
        )
        .await
    }

    async fn storage_overselling(&self, percentage: &str) -> Result<()> {
        self.post("storage-overselling", json!({"percentage": percentage}))
            .await
    }

    async fn delete_app_group(&self, namespace: &str, name: &str) -> Result<()> {
        self.post(
            "delete-app-group",
            json!({"namespace": namespace, "name": name}),
        )
        .await
    }

    async fn sync_mcp_bridge(&self, namespace: &str, name: &str) -> Result<()> {
        self.post("sync-mcp-bridge", json!({"namespace": namespace, "name": name}))
            .await
    }
}
