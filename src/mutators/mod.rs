//! Per-kind admission mutators.
//!
//! Each mutator decodes the submitted object, computes the desired copy and
//! returns a [`Decision`]. Persistent side effects are only ever queued on the
//! request's task buffer; the dispatcher hands them to the scheduler after
//! the decision exists.

mod ingress;
mod node;
mod passthrough;
mod pod;
mod policy;
mod service_account;
mod storage;
mod workload;

pub use ingress::{
    GATEWAY_SSL_REDIRECT_ANNOTATION, IngressMutator, SSL_REDIRECT_ANNOTATION, release_tls_secrets,
};
pub use node::{
    CREATE_DEFAULT_DISK_LABEL, DEFAULT_DISKS_ANNOTATION, DEFAULT_DISKS_CONFIG, MASTER_LABEL,
    NodeMutator,
};
pub use passthrough::{ConfigMapMutator, McpBridgeMutator, SecretMutator, ServiceMutator};
pub use pod::{PAUSED_MESSAGE, PodMutator};
pub use policy::{AppClusterMutator, TenantClusterMutator, VirtualClusterPolicyMutator};
pub use service_account::{RESTART_ANNOTATION, ServiceAccountMutator};
pub use storage::{
    DEFAULT_CLASS_ANNOTATION, LonghornNodeMutator, LonghornReplicaMutator, StorageClassMutator,
};
pub use workload::{REGISTRIES_PATH, REGISTRIES_VOLUME, TENANT_CLUSTER_LABEL, WorkloadMutator};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::core::admission::AdmissionRequest;
use serde::de::DeserializeOwned;

use crate::cluster::ClusterApi;
use crate::config::Settings;
use crate::error::{AdmissionError, Result};
use crate::hooks::PlatformHooks;
use crate::imaging::DigestResolver;
use crate::scheduler::{ScheduledTask, TaskBuffer};
use crate::tenant::TenantQuota;
use crate::webhooks::Decision;

/// Annotation gating pod creation for a tenant control plane
pub const CREATE_POD_ANNOTATION: &str = "w7.cc/create-pod";

/// Decision function for one (kind, group).
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> std::result::Result<Decision, AdmissionError>;
}

/// Long-lived collaborators shared by every request.
#[derive(Clone)]
pub struct Services {
    pub cluster: Arc<dyn ClusterApi>,
    pub hooks: Arc<dyn PlatformHooks>,
    pub resolver: Arc<dyn DigestResolver>,
    pub settings: Arc<Settings>,
}

/// Per-request view handed to a mutator.
pub struct MutationContext {
    pub cluster: Arc<dyn ClusterApi>,
    pub hooks: Arc<dyn PlatformHooks>,
    pub resolver: Arc<dyn DigestResolver>,
    pub settings: Arc<Settings>,
    tasks: TaskBuffer,
}

impl MutationContext {
    pub fn new(services: &Services) -> Self {
        Self {
            cluster: services.cluster.clone(),
            hooks: services.hooks.clone(),
            resolver: services.resolver.clone(),
            settings: services.settings.clone(),
            tasks: TaskBuffer::default(),
        }
    }

    /// Queue follow-up work to run after the response
    pub fn defer<F>(&self, name: &'static str, delay: Duration, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(ScheduledTask::new(name, delay, work));
    }

    pub fn take_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.drain()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Read the tenant's quota snapshot. One keyed lookup, no listing.
    pub async fn tenant_quota(&self, tenant: &str) -> Result<Option<TenantQuota>> {
        let account = self
            .cluster
            .get_service_account(&self.settings.tenant_account_namespace, tenant)
            .await?;
        Ok(account.as_ref().map(TenantQuota::from_service_account))
    }
}

/// Decode the submitted object into a typed value.
pub(crate) fn decode_object<K: DeserializeOwned>(
    request: &AdmissionRequest<DynamicObject>,
) -> std::result::Result<K, AdmissionError> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| AdmissionError::Protocol("request has no object".to_string()))?;
    decode(object)
}

/// Decode the previous object; present on UPDATE and DELETE.
pub(crate) fn decode_old_object<K: DeserializeOwned>(
    request: &AdmissionRequest<DynamicObject>,
) -> std::result::Result<K, AdmissionError> {
    let object = request
        .old_object
        .as_ref()
        .ok_or_else(|| AdmissionError::Protocol("request has no old object".to_string()))?;
    decode(object)
}

fn decode<K: DeserializeOwned>(object: &DynamicObject) -> std::result::Result<K, AdmissionError> {
    let value = serde_json::to_value(object)
        .map_err(|e| AdmissionError::Internal(format!("re-encode object: {}", e)))?;
    serde_json::from_value(value).map_err(|e| AdmissionError::Protocol(format!("decode object: {}", e)))
}
