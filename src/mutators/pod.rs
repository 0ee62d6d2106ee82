//! Pod governance: pause gate, tenant limits, bandwidth and lxcfs mounts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{HostPathVolumeSource, Pod, Volume, VolumeMount};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use tracing::{debug, warn};

use super::{CREATE_POD_ANNOTATION, MutationContext, Mutator, decode_object};
use crate::error::AdmissionError;
use crate::governance::{self, WorkloadRole};
use crate::tenant::tenant_for_namespace;
use crate::webhooks::Decision;

pub const PAUSED_MESSAGE: &str = "pod creation not allowed: tenant is paused";

const LXCFS_PATHS: [(&str, &str); 8] = [
    ("lxcfs-proc-cpuinfo", "/proc/cpuinfo"),
    ("lxcfs-proc-meminfo", "/proc/meminfo"),
    ("lxcfs-proc-diskstats", "/proc/diskstats"),
    ("lxcfs-proc-stat", "/proc/stat"),
    ("lxcfs-proc-swaps", "/proc/swaps"),
    ("lxcfs-proc-uptime", "/proc/uptime"),
    ("lxcfs-proc-loadavg", "/proc/loadavg"),
    ("lxcfs-sys-devices-system-cpu-online", "/sys/devices/system/cpu/online"),
];

pub struct PodMutator;

#[async_trait]
impl Mutator for PodMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("pod deletion needs no mutation"));
        }
        let original: Pod = decode_object(request)?;

        let gated = original
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CREATE_POD_ANNOTATION))
            .is_some_and(|v| v == "false");
        if gated && request.operation == Operation::Create {
            return Ok(Decision::denied(PAUSED_MESSAGE));
        }

        let mut pod = original.clone();
        let namespace = request
            .namespace
            .clone()
            .or_else(|| original.metadata.namespace.clone())
            .unwrap_or_default();

        if ctx.settings.is_root() {
            if let Some(tenant) = tenant_for_namespace(&namespace) {
                match ctx.tenant_quota(tenant).await {
                    Ok(Some(quota)) => {
                        if quota.paused && request.operation == Operation::Create {
                            return Ok(Decision::denied(PAUSED_MESSAGE));
                        }
                        let role = WorkloadRole::from_label(
                            pod.metadata
                                .labels
                                .as_ref()
                                .and_then(|l| l.get("role"))
                                .map(String::as_str),
                        );
                        let governed = governance::limits(&quota, role);
                        let limits = governance::resolve(governed.limits, ctx.cluster.as_ref())
                            .await
                            .map_err(AdmissionError::from)?;
                        if let (Some(limits), Some(spec)) = (limits, pod.spec.as_mut()) {
                            governance::fill_pod_limits(spec, limits);
                        }
                        if let Some(bandwidth) = &governed.bandwidth {
                            let annotations =
                                pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
                            governance::apply_bandwidth(annotations, bandwidth);
                        }
                    }
                    Ok(None) => debug!(tenant, "No identity account for tenant namespace"),
                    Err(e) => {
                        // a failed quota read skips governance rather than blocking the pod
                        warn!(tenant, error = %e, "Failed to read tenant quota");
                    }
                }
            }
        }

        if ctx.settings.lxcfs_enabled {
            if let Some(spec) = pod.spec.as_mut() {
                inject_lxcfs(spec);
            }
        }

        Decision::from_diff(
            &original,
            &pod,
            "pod needs no resource configuration",
            "pod resources configured",
        )
    }
}

/// Mount lxcfs views over /proc so containers see their own limits.
fn inject_lxcfs(spec: &mut k8s_openapi::api::core::v1::PodSpec) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    for (name, path) in LXCFS_PATHS {
        if volumes.iter().any(|v| v.name == name) {
            continue;
        }
        volumes.push(Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: format!("/var/lib/lxcfs{}", path),
                type_: Some("File".to_string()),
            }),
            ..Default::default()
        });
    }
    for container in spec.containers.iter_mut() {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        for (name, path) in LXCFS_PATHS {
            if mounts.iter().any(|m| m.name == name) {
                continue;
            }
            mounts.push(VolumeMount {
                name: name.to_string(),
                mount_path: path.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }
}
