//! Storage-engine admission: disk tags, default class, replica notifications.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};

use super::{MutationContext, Mutator, decode_object};
use crate::error::AdmissionError;
use crate::resources::custom::LonghornNode;
use crate::webhooks::Decision;

pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
pub const STORAGE_CLASS_NAME: &str = "longhorn";

const NODE_READY_DELAY: Duration = Duration::from_secs(5);
const REPLICA_DELAY: Duration = Duration::from_secs(5);

/// Tags untagged disks with their own name so volumes can select them.
pub struct LonghornNodeMutator;

#[async_trait]
impl Mutator for LonghornNodeMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("storage node deletion"));
        }
        let original: LonghornNode = decode_object(request)?;
        let Some(disks) = original.spec.disks.as_ref() else {
            return Ok(Decision::allowed("storage node has no disks"));
        };
        let mut node = original.clone();
        let mut tagged = disks.clone();
        for (name, disk) in tagged.iter_mut() {
            if disk.tags.as_ref().is_none_or(Vec::is_empty) {
                disk.tags = Some(vec![name.clone()]);
            }
        }
        node.spec.disks = Some(tagged);

        let hooks = ctx.hooks.clone();
        let name = original.metadata.name.clone().unwrap_or_default();
        ctx.defer("storage-node-ready", NODE_READY_DELAY, async move {
            hooks.storage_node_ready(&name).await
        });

        Decision::from_diff(
            &original,
            &node,
            "storage disks already tagged",
            "storage disks tagged",
        )
    }
}

/// Keeps the bundled storage class from claiming the cluster default.
pub struct StorageClassMutator;

#[async_trait]
impl Mutator for StorageClassMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        _ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("storage class deletion"));
        }
        let original: StorageClass = decode_object(request)?;
        if original.metadata.name.as_deref() != Some(STORAGE_CLASS_NAME) {
            return Ok(Decision::allowed("storage class not managed"));
        }
        let mut class = original.clone();
        if let Some(annotations) = class.metadata.annotations.as_mut() {
            if annotations.get(DEFAULT_CLASS_ANNOTATION).is_some_and(|v| v == "true") {
                annotations.insert(DEFAULT_CLASS_ANNOTATION.to_string(), "false".to_string());
            }
        }
        Decision::from_diff(
            &original,
            &class,
            "storage class unchanged",
            "storage class is no longer the default",
        )
    }
}

/// Replica changes only notify the platform.
pub struct LonghornReplicaMutator;

#[async_trait]
impl Mutator for LonghornReplicaMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        let object = request.object.as_ref().or(request.old_object.as_ref());
        let volume = object
            .and_then(|o| o.data.get("spec"))
            .and_then(|s| s.get("volumeName"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(volume) = volume {
            let hooks = ctx.hooks.clone();
            let namespace = request.namespace.clone().unwrap_or_default();
            ctx.defer("storage-replicas-changed", REPLICA_DELAY, async move {
                hooks.storage_replicas_changed(&namespace, &volume).await
            });
        }
        Ok(Decision::allowed("replica change noted"))
    }
}
