//! Deployment / StatefulSet / DaemonSet resource injection.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, HostPathVolumeSource, PodSpec, ResourceFieldSelector, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use tracing::{debug, warn};

use super::{CREATE_POD_ANNOTATION, MutationContext, Mutator, decode_object};
use crate::error::AdmissionError;
use crate::governance::{self, RequestPolicy, WorkloadRole};
use crate::imaging::{PIN_ANNOTATION, pin_workload_images};
use crate::resources::workload::{Workload, WorkloadKind};
use crate::webhooks::Decision;

pub const TENANT_CLUSTER_LABEL: &str = "cluster";
pub const REGISTRIES_VOLUME: &str = "registries-volume";
pub const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";

const PIN_DELAY: Duration = Duration::from_secs(5);

pub struct WorkloadMutator {
    kind: WorkloadKind,
}

impl WorkloadMutator {
    pub fn new(kind: WorkloadKind) -> Self {
        Self { kind }
    }

    fn decode(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<Workload, AdmissionError> {
        Ok(match self.kind {
            WorkloadKind::Deployment => Workload::Deployment(decode_object::<Deployment>(request)?),
            WorkloadKind::StatefulSet => {
                Workload::StatefulSet(decode_object::<StatefulSet>(request)?)
            }
            WorkloadKind::DaemonSet => Workload::DaemonSet(decode_object::<DaemonSet>(request)?),
        })
    }
}

#[async_trait]
impl Mutator for WorkloadMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> Result<Decision, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(Decision::allowed("workload deletion needs no mutation"));
        }
        let original = self.decode(request)?;
        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| original.namespace().to_string());
        let name = if request.name.is_empty() {
            original.name().to_string()
        } else {
            request.name.clone()
        };

        if original.annotation(PIN_ANNOTATION) == Some("true") && !name.is_empty() {
            let cluster = ctx.cluster.clone();
            let resolver = ctx.resolver.clone();
            let kind = self.kind;
            let (ns, n) = (namespace.clone(), name.clone());
            ctx.defer("pin-images", PIN_DELAY, async move {
                pin_workload_images(cluster.as_ref(), resolver.as_ref(), kind, &ns, &n).await
            });
        }

        let Some(tenant) = original.label(TENANT_CLUSTER_LABEL).map(str::to_string) else {
            return Ok(Decision::allowed("workload is not part of a tenant cluster"));
        };

        let mut workload = original.clone();
        if self.kind != WorkloadKind::DaemonSet {
            if let Some(spec) = workload.pod_spec_mut() {
                ensure_registries_mount(spec);
            }
        }

        let role = WorkloadRole::from_label(original.label(self.kind.role_label()));
        let limits = match ctx.tenant_quota(&tenant).await {
            Ok(Some(quota)) => {
                let governed = governance::limits(&quota, role);
                governance::resolve(governed.limits, ctx.cluster.as_ref())
                    .await
                    .map_err(AdmissionError::from)?
            }
            Ok(None) => {
                debug!(tenant = %tenant, "No identity account for tenant");
                None
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to read tenant quota");
                None
            }
        };

        let requests = match self.kind {
            WorkloadKind::DaemonSet => RequestPolicy::MatchLimits,
            _ => RequestPolicy::Zero,
        };
        if let (Some(limits), Some(spec)) = (limits, workload.pod_spec_mut()) {
            for container in spec.containers.iter_mut() {
                governance::enforce_container_limits(container, limits, requests);
            }
        }

        if let Workload::StatefulSet(sts) = &mut workload {
            configure_control_plane(sts);
        }

        Decision::from_diff(
            &original,
            &workload,
            "workload already configured",
            "workload resources configured",
        )
    }
}

/// Mount the node's registry configuration into every container, once.
fn ensure_registries_mount(spec: &mut PodSpec) {
    let already_mounted = spec.containers.iter().any(|c| {
        c.volume_mounts
            .iter()
            .flatten()
            .any(|m| m.mount_path == REGISTRIES_PATH && m.name != REGISTRIES_VOLUME)
    });
    if already_mounted {
        return;
    }

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == REGISTRIES_VOLUME) {
        volumes.push(Volume {
            name: REGISTRIES_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: REGISTRIES_PATH.to_string(),
                type_: Some("File".to_string()),
            }),
            ..Default::default()
        });
    }
    for container in spec.containers.iter_mut() {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == REGISTRIES_VOLUME) {
            mounts.push(VolumeMount {
                name: REGISTRIES_VOLUME.to_string(),
                mount_path: REGISTRIES_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }
}

/// GOMAXPROCS from the CPU limit, and the tenant pause gate on the template.
fn configure_control_plane(sts: &mut StatefulSet) {
    let gate = sts
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CREATE_POD_ANNOTATION))
        .cloned();
    let Some(spec) = sts.spec.as_mut() else {
        return;
    };

    if let Some(pod_spec) = spec.template.spec.as_mut() {
        for container in pod_spec.containers.iter_mut() {
            let env = container.env.get_or_insert_with(Vec::new);
            if !env.iter().any(|e| e.name == "GOMAXPROCS") {
                env.push(EnvVar {
                    name: "GOMAXPROCS".to_string(),
                    value_from: Some(EnvVarSource {
                        resource_field_ref: Some(ResourceFieldSelector {
                            resource: "limits.cpu".to_string(),
                            divisor: Some(Quantity("1".to_string())),
                            container_name: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }
    }

    if let Some(gate) = gate {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(CREATE_POD_ANNOTATION.to_string(), gate.clone());
        if gate == "false" {
            spec.replicas = Some(0);
        }
    }
}
