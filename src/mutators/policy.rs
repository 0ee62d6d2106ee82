//! Tenant placement policies and cluster-shaped custom resources.
//!
//! None of these mutate the object; they only queue platform notifications.

use std::time::Duration;

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};

use super::{MutationContext, Mutator, decode_object};
use crate::error::AdmissionError;
use crate::resources::custom::VirtualClusterPolicy;
use crate::webhooks::Decision;

/// Publishes every accepted policy to the platform catalog.
pub struct VirtualClusterPolicyMutator;

#[async_trait]
impl Mutator for VirtualClusterPolicyMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("policy deletion"));
        }
        let policy: VirtualClusterPolicy = decode_object(request)?;
        let hooks = ctx.hooks.clone();
        ctx.defer("publish-policy", Duration::ZERO, async move {
            hooks.publish_policy(&policy).await
        });
        Ok(Decision::allowed("policy accepted"))
    }
}

/// Tenant virtual clusters are admitted unchanged.
pub struct TenantClusterMutator;

#[async_trait]
impl Mutator for TenantClusterMutator {
    async fn decide(
        &self,
        _request: &AdmissionRequest<DynamicObject>,
        _ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        Ok(Decision::allowed("tenant cluster accepted"))
    }
}

/// Deleting an application database cluster removes its app group.
pub struct AppClusterMutator;

#[async_trait]
impl Mutator for AppClusterMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            let hooks = ctx.hooks.clone();
            let namespace = request.namespace.clone().unwrap_or_default();
            let name = request.name.clone();
            ctx.defer("delete-app-group", Duration::ZERO, async move {
                hooks.delete_app_group(&namespace, &name).await
            });
        }
        Ok(Decision::allowed("application cluster accepted"))
    }
}
