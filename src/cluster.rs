//! Narrow view of the API server used by mutators, scheduled tasks and
//! startup. `KubeCluster` is the production implementation; tests supply an
//! in-memory one.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod, Secret, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::quantity::{ResourceAmounts, parse_bytes, parse_cpu_millis};
use crate::resources::custom::{LONGHORN_GROUP, LONGHORN_NAMESPACE, LONGHORN_VERSION};
use crate::resources::workload::{Workload, WorkloadKind};

/// Field manager for patches issued by the engine
pub const FIELD_MANAGER: &str = "tenant-admission";

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Fails with an already-exists error when the name is taken
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
    /// Fails with a conflict error when the resource version is stale
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
    /// Deleting a missing secret succeeds
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service_account(&self, namespace: &str, name: &str)
    -> Result<Option<ServiceAccount>>;

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>>;

    /// Sum of allocatable CPU and memory across all nodes
    async fn node_allocatable(&self) -> Result<ResourceAmounts>;

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;
    async fn replace_workload(&self, workload: &Workload) -> Result<()>;
    async fn merge_patch_statefulset(&self, namespace: &str, name: &str, patch: &Value)
    -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the storage-engine node mirroring a cluster node
    async fn delete_storage_node(&self, name: &str) -> Result<()>;

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>>;
    async fn create_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()>;
    async fn replace_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()>;
}

/// `ClusterApi` backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn storage_nodes(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(LONGHORN_GROUP, LONGHORN_VERSION, "Node");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "nodes");
        Api::namespaced_with(self.client.clone(), LONGHORN_NAMESPACE, &resource)
    }
}

/// Map a 404 on delete to success.
fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Translate write races into the engine's own variants.
fn classify_write<T>(result: kube::Result<T>, what: &str) -> Result<T> {
    match result {
        Ok(v) => Ok(v),
        Err(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists" => {
            Err(Error::AlreadyExists(what.to_string()))
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::Conflict(what.to_string())),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("secret {}/{}", namespace, secret.metadata.name.as_deref().unwrap_or_default());
        classify_write(api.create(&PostParams::default(), secret).await, &what)
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.clone().unwrap_or_default();
        let what = format!("secret {}/{}", namespace, name);
        classify_write(api.replace(&name, &PostParams::default(), secret).await, &what)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn node_allocatable(&self) -> Result<ResourceAmounts> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        let mut total = ResourceAmounts::ZERO;
        for node in nodes.items {
            let Some(allocatable) = node.status.and_then(|s| s.allocatable) else {
                continue;
            };
            if let Some(cpu) = allocatable.get("cpu").and_then(|q| parse_cpu_millis(&q.0)) {
                total.cpu_millis += cpu;
            }
            if let Some(mem) = allocatable.get("memory").and_then(|q| parse_bytes(&q.0)) {
                total.memory_bytes += mem;
            }
        }
        debug!(cpu_millis = total.cpu_millis, memory_bytes = total.memory_bytes, "Summed node allocatable");
        Ok(total)
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        let client = self.client.clone();
        Ok(match kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::Deployment),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::StatefulSet),
            WorkloadKind::DaemonSet => Api::<DaemonSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::DaemonSet),
        })
    }

    async fn replace_workload(&self, workload: &Workload) -> Result<()> {
        let client = self.client.clone();
        let namespace = workload.namespace();
        let name = workload.name();
        let what = format!("{} {}/{}", workload.kind(), namespace, name);
        let pp = PostParams::default();
        match workload {
            Workload::Deployment(d) => classify_write(
                Api::<Deployment>::namespaced(client, namespace).replace(name, &pp, d).await,
                &what,
            )
            .map(|_| ()),
            Workload::StatefulSet(s) => classify_write(
                Api::<StatefulSet>::namespaced(client, namespace).replace(name, &pp, s).await,
                &what,
            )
            .map(|_| ()),
            Workload::DaemonSet(d) => classify_write(
                Api::<DaemonSet>::namespaced(client, namespace).replace(name, &pp, d).await,
                &what,
            )
            .map(|_| ()),
        }
    }

    async fn merge_patch_statefulset(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_storage_node(&self, name: &str) -> Result<()> {
        ignore_not_found(self.storage_nodes().delete(name, &DeleteParams::default()).await)
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let what = format!(
            "mutatingwebhookconfiguration {}",
            config.metadata.name.as_deref().unwrap_or_default()
        );
        classify_write(api.create(&PostParams::default(), config).await, &what).map(|_| ())
    }

    async fn replace_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let name = config.metadata.name.clone().unwrap_or_default();
        let what = format!("mutatingwebhookconfiguration {}", name);
        classify_write(api.replace(&name, &PostParams::default(), config).await, &what)
            .map(|_| ())
    }
}
