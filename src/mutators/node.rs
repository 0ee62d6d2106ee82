//! Cluster node admission: default storage disk configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};

use super::{MutationContext, Mutator, decode_object};
use crate::error::AdmissionError;
use crate::webhooks::Decision;

pub const MASTER_LABEL: &str = "node-role.kubernetes.io/master";
pub const CREATE_DEFAULT_DISK_LABEL: &str = "node.longhorn.io/create-default-disk";
pub const DEFAULT_DISKS_ANNOTATION: &str = "node.longhorn.io/default-disks-config";
pub const DEFAULT_DISKS_CONFIG: &str = r#"[ { "path":"/var/lib/longhorn", "allowScheduling":true, "name": "disk-default", "tags":[ "disk-default" ] } ]"#;

const STORAGE_NODE_REMOVAL_DELAY: Duration = Duration::from_secs(1);

pub struct NodeMutator;

#[async_trait]
impl Mutator for NodeMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            let cluster = ctx.cluster.clone();
            let name = request.name.clone();
            ctx.defer("remove-storage-node", STORAGE_NODE_REMOVAL_DELAY, async move {
                cluster.delete_storage_node(&name).await
            });
            return Ok(Decision::allowed("node deletion queued storage cleanup"));
        }

        let original: Node = decode_object(request)?;
        let mut node = original.clone();

        let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        let is_master = labels.get(MASTER_LABEL).is_some_and(|v| v == "true");
        if !is_master || labels.contains_key(CREATE_DEFAULT_DISK_LABEL) {
            return Ok(Decision::allowed("node disk configuration not managed"));
        }
        labels.insert(CREATE_DEFAULT_DISK_LABEL.to_string(), "config".to_string());
        node.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                DEFAULT_DISKS_ANNOTATION.to_string(),
                DEFAULT_DISKS_CONFIG.to_string(),
            );

        Decision::from_diff(
            &original,
            &node,
            "node disk configuration present",
            "node disk configuration set",
        )
    }
}
