//! Kinds that are admitted as-is or with a single field default, mostly to
//! trigger platform synchronisation.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};

use super::{MutationContext, Mutator, decode_object, decode_old_object};
use crate::error::AdmissionError;
use crate::webhooks::Decision;

pub const OVERSELLING_NAMESPACE: &str = "kube-system";
pub const OVERSELLING_CONFIG: &str = "k3k.overselling.config";

const SECRET_FAN_OUT_DELAY: Duration = Duration::from_secs(10);
const OVERSELLING_DELAY: Duration = Duration::from_secs(1);
const MCP_BRIDGE_DELAY: Duration = Duration::from_secs(5);

/// Defaults the load balancer class of classless LoadBalancer services.
pub struct ServiceMutator;

#[async_trait]
impl Mutator for ServiceMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("service deletion"));
        }
        let original: Service = decode_object(request)?;
        let Some(class) = ctx.settings.load_balancer_class.as_ref() else {
            return Ok(Decision::allowed("no load balancer class configured"));
        };
        let mut service = original.clone();
        if let Some(spec) = service.spec.as_mut() {
            if spec.type_.as_deref() == Some("LoadBalancer") && spec.load_balancer_class.is_none() {
                spec.load_balancer_class = Some(class.clone());
            }
        }
        Decision::from_diff(
            &original,
            &service,
            "service needs no changes",
            "load balancer class set",
        )
    }
}

/// Secrets flow up to the parent from tenant clusters and down to tenants
/// from the root cluster.
pub struct SecretMutator;

#[async_trait]
impl Mutator for SecretMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        let deleting = request.operation == Operation::Delete;
        let secret: Secret = if deleting {
            decode_old_object(request)?
        } else {
            decode_object(request)?
        };

        if ctx.settings.virtual_tenant {
            let hooks = ctx.hooks.clone();
            let object = serde_json::to_value(&secret)
                .map_err(|e| AdmissionError::Internal(format!("encode secret: {}", e)))?;
            ctx.defer("sync-secret-to-parent", Duration::ZERO, async move {
                hooks.sync_to_parent("sync-secret", &object).await
            });
        }
        if !deleting && ctx.settings.is_root() {
            let hooks = ctx.hooks.clone();
            ctx.defer("sync-secret-to-tenants", SECRET_FAN_OUT_DELAY, async move {
                hooks.sync_secret_to_tenants(&secret).await
            });
        }
        Ok(Decision::allowed("secret accepted"))
    }
}

/// Watches the storage overselling configuration.
pub struct ConfigMapMutator;

#[async_trait]
impl Mutator for ConfigMapMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("configmap deletion"));
        }
        let config: ConfigMap = decode_object(request)?;
        let is_overselling = config.metadata.namespace.as_deref() == Some(OVERSELLING_NAMESPACE)
            && config.metadata.name.as_deref() == Some(OVERSELLING_CONFIG);
        if is_overselling {
            let percentage = config
                .data
                .as_ref()
                .and_then(|d| d.get("storage"))
                .cloned()
                .unwrap_or_default();
            let hooks = ctx.hooks.clone();
            ctx.defer("storage-overselling", OVERSELLING_DELAY, async move {
                hooks.storage_overselling(&percentage).await
            });
        }
        Ok(Decision::allowed("configmap accepted"))
    }
}

/// Gateway service-discovery bridges are re-synced after every change.
pub struct McpBridgeMutator;

#[async_trait]
impl Mutator for McpBridgeMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        let hooks = ctx.hooks.clone();
        let namespace = request.namespace.clone().unwrap_or_default();
        let name = request.name.clone();
        ctx.defer("sync-mcp-bridge", MCP_BRIDGE_DELAY, async move {
            hooks.sync_mcp_bridge(&namespace, &name).await
        });
        Ok(Decision::allowed("bridge accepted"))
    }
}
