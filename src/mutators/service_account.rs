//! Tenant identity updates: restart or pause the tenant's control plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use serde_json::{Map, Value, json};
use tracing::info;

use super::{CREATE_POD_ANNOTATION, MutationContext, Mutator, decode_object, decode_old_object};
use crate::cluster::ClusterApi;
use crate::error::{AdmissionError, Result};
use crate::governance::{self, EGRESS_BANDWIDTH_ANNOTATION, INGRESS_BANDWIDTH_ANNOTATION};
use crate::tenant::{TenantMode, TenantQuota};
use crate::webhooks::Decision;

pub const RESTART_ANNOTATION: &str = "restart";

const RESTART_DELAY: Duration = Duration::from_secs(3);

pub struct ServiceAccountMutator;

#[async_trait]
impl Mutator for ServiceAccountMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> std::result::Result<Decision, AdmissionError> {
        if request.operation != Operation::Update {
            return Ok(Decision::allowed("service account needs no changes"));
        }
        let current = TenantQuota::from_service_account(&decode_object::<ServiceAccount>(request)?);
        if current.mode != TenantMode::IsolatedVirtual {
            return Ok(Decision::allowed("service account needs no changes"));
        }
        let previous =
            TenantQuota::from_service_account(&decode_old_object::<ServiceAccount>(request)?);
        if previous.mode != TenantMode::IsolatedVirtual {
            return Ok(Decision::allowed("service account needs no changes"));
        }

        let namespace = current.control_plane_namespace();
        let statefulset = format!("{}-server", namespace);

        if previous.paused != current.paused {
            let cluster = ctx.cluster.clone();
            let paused = current.paused;
            let (ns, sts) = (namespace.clone(), statefulset.clone());
            ctx.defer("pause-control-plane", Duration::ZERO, async move {
                set_paused(cluster, &ns, &sts, paused).await
            });
        }

        if previous.resources_changed(&current) || previous.maintenance != current.maintenance {
            let cluster = ctx.cluster.clone();
            let bandwidth = governance::bandwidth(&current);
            ctx.defer("restart-control-plane", RESTART_DELAY, async move {
                restart(cluster, &namespace, &statefulset, bandwidth).await
            });
            return Ok(Decision::allowed("tenant limits changed, control plane restart queued"));
        }

        Ok(Decision::allowed("service account needs no changes"))
    }
}

/// Bump the restart stamp so the control plane rolls with its new limits.
async fn restart(
    cluster: Arc<dyn ClusterApi>,
    namespace: &str,
    statefulset: &str,
    bandwidth: Option<String>,
) -> Result<()> {
    let stamp = jiff::Timestamp::now().to_string();
    let mut template = Map::new();
    template.insert(RESTART_ANNOTATION.to_string(), Value::String(stamp.clone()));
    if let Some(bandwidth) = bandwidth {
        template.insert(
            INGRESS_BANDWIDTH_ANNOTATION.to_string(),
            Value::String(bandwidth.clone()),
        );
        template.insert(EGRESS_BANDWIDTH_ANNOTATION.to_string(), Value::String(bandwidth));
    }
    let patch = json!({
        "metadata": { "annotations": { RESTART_ANNOTATION: stamp } },
        "spec": { "template": { "metadata": { "annotations": template } } }
    });
    cluster
        .merge_patch_statefulset(namespace, statefulset, &patch)
        .await?;
    info!(namespace, statefulset, "Restarted tenant control plane");
    Ok(())
}

async fn set_paused(
    cluster: Arc<dyn ClusterApi>,
    namespace: &str,
    statefulset: &str,
    paused: bool,
) -> Result<()> {
    let gate = if paused { "false" } else { "true" };
    let patch = json!({
        "metadata": { "annotations": { CREATE_POD_ANNOTATION: gate } },
        "spec": { "template": { "metadata": { "annotations": { CREATE_POD_ANNOTATION: gate } } } }
    });
    cluster
        .merge_patch_statefulset(namespace, statefulset, &patch)
        .await?;
    if paused {
        cluster
            .delete_pod(namespace, &format!("{}-0", statefulset))
            .await?;
    }
    info!(namespace, statefulset, paused, "Updated tenant pause state");
    Ok(())
}
