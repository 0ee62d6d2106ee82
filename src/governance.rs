//! Resource governance policy.
//!
//! Decides which CPU/memory limits and bandwidth annotations a tenant's
//! workload gets, and applies them to pod specs. The decision itself is a
//! pure function of the quota snapshot and the workload role; only the
//! zero-quota fallback for virtual tenants needs a cluster read.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::quantity::{GIB, MIB, ResourceAmounts, cpu_equals, memory_equals, parse_bytes, parse_cpu_millis};
use crate::tenant::{TenantMode, TenantQuota};

pub const INGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/ingress-bandwidth";
pub const EGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/egress-bandwidth";

/// Shared-mode control-plane server floor
pub const SHARED_SERVER_LIMITS: ResourceAmounts = ResourceAmounts {
    cpu_millis: 500,
    memory_bytes: GIB,
};
/// Shared-mode control-plane agent floor
pub const SHARED_AGENT_LIMITS: ResourceAmounts = ResourceAmounts {
    cpu_millis: 100,
    memory_bytes: 100 * MIB,
};
/// Fallback per-pod limits for shared tenants without explicit limit bounds
pub const SHARED_DEFAULT_POD_LIMITS: ResourceAmounts = ResourceAmounts {
    cpu_millis: 250,
    memory_bytes: 500 * MIB,
};

/// Role of a workload inside a tenant's virtual control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadRole {
    Server,
    Agent,
    /// Labelled with some other role
    Other,
    /// No role label: an ordinary tenant workload
    Unlabelled,
}

impl WorkloadRole {
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("server") => WorkloadRole::Server,
            Some("agent") => WorkloadRole::Agent,
            Some(_) => WorkloadRole::Other,
            None => WorkloadRole::Unlabelled,
        }
    }
}

/// Where a workload's limits come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitSource {
    /// No limits are injected
    Unmanaged,
    Fixed(ResourceAmounts),
    /// Sum of node allocatable capacity, multiplied by `factor`
    ClusterCapacity { factor: i64 },
}

/// Governance outcome for one (quota, role) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Governance {
    pub limits: LimitSource,
    /// Bandwidth quantity stamped on both directions, e.g. `100M`
    pub bandwidth: Option<String>,
}

impl Governance {
    /// Whether anything needs to be applied
    pub fn is_managed(&self) -> bool {
        self.limits != LimitSource::Unmanaged || self.bandwidth.is_some()
    }
}

/// Compute the governance outcome for a tenant workload.
pub fn limits(quota: &TenantQuota, role: WorkloadRole) -> Governance {
    Governance {
        limits: limit_source(quota, role),
        bandwidth: bandwidth(quota),
    }
}

fn limit_source(quota: &TenantQuota, role: WorkloadRole) -> LimitSource {
    if !quota.has_hard {
        return LimitSource::Unmanaged;
    }
    match quota.mode {
        TenantMode::IsolatedVirtual => {
            if role == WorkloadRole::Unlabelled {
                return LimitSource::Unmanaged;
            }
            // maintenance runs old and new control planes side by side
            let factor = if quota.maintenance { 2 } else { 1 };
            if quota.hard.is_zero() {
                LimitSource::ClusterCapacity { factor }
            } else {
                LimitSource::Fixed(quota.hard.scaled(factor))
            }
        }
        TenantMode::Shared => match role {
            WorkloadRole::Server => LimitSource::Fixed(SHARED_SERVER_LIMITS),
            WorkloadRole::Agent => LimitSource::Fixed(SHARED_AGENT_LIMITS),
            WorkloadRole::Other => LimitSource::Unmanaged,
            WorkloadRole::Unlabelled => shared_pod_limits(quota),
        },
        TenantMode::ClusterOwner | TenantMode::Normal => LimitSource::Unmanaged,
    }
}

/// Plain pods of a shared tenant are bounded by the tenant's limit section.
fn shared_pod_limits(quota: &TenantQuota) -> LimitSource {
    let limit = quota.limit;
    if quota.hard.is_zero() {
        if limit.cpu_millis != 0 && limit.memory_bytes != 0 {
            LimitSource::Fixed(limit)
        } else {
            LimitSource::Unmanaged
        }
    } else {
        LimitSource::Fixed(ResourceAmounts::new(
            if limit.cpu_millis == 0 {
                SHARED_DEFAULT_POD_LIMITS.cpu_millis
            } else {
                limit.cpu_millis
            },
            if limit.memory_bytes == 0 {
                SHARED_DEFAULT_POD_LIMITS.memory_bytes
            } else {
                limit.memory_bytes
            },
        ))
    }
}

/// Bandwidth annotation value, independent of mode.
pub fn bandwidth(quota: &TenantQuota) -> Option<String> {
    (quota.bandwidth_mbps > 0).then(|| format!("{}M", quota.bandwidth_mbps))
}

/// Resolve a limit source to concrete amounts, reading cluster capacity only
/// when the tenant's hard bounds are zero.
pub async fn resolve(source: LimitSource, cluster: &dyn ClusterApi) -> Result<Option<ResourceAmounts>> {
    match source {
        LimitSource::Unmanaged => Ok(None),
        LimitSource::Fixed(amounts) => Ok(Some(amounts)),
        LimitSource::ClusterCapacity { factor } => {
            let capacity = cluster.node_allocatable().await?;
            Ok((!capacity.is_zero()).then(|| capacity.scaled(factor)))
        }
    }
}

/// Stamp both bandwidth annotations. Returns whether anything changed.
pub fn apply_bandwidth(annotations: &mut BTreeMap<String, String>, value: &str) -> bool {
    let mut changed = false;
    for key in [INGRESS_BANDWIDTH_ANNOTATION, EGRESS_BANDWIDTH_ANNOTATION] {
        if annotations.get(key).map(String::as_str) != Some(value) {
            annotations.insert(key.to_string(), value.to_string());
            changed = true;
        }
    }
    changed
}

/// How requests are written alongside limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPolicy {
    /// Zero requests so the scheduler never reserves tenant capacity
    Zero,
    /// Requests equal to limits
    MatchLimits,
}

fn quantity_is_zero(q: Option<&Quantity>, cpu: bool) -> bool {
    match q {
        None => true,
        Some(q) if cpu => parse_cpu_millis(&q.0).is_none_or(|v| v == 0),
        Some(q) => parse_bytes(&q.0).is_none_or(|v| v == 0),
    }
}

/// Fill limits a pod's containers leave unset and zero its unset requests.
///
/// Limits the workload already declares are kept.
pub fn fill_pod_limits(spec: &mut PodSpec, limits: ResourceAmounts) {
    let init = spec.init_containers.iter_mut().flatten();
    for container in spec.containers.iter_mut().chain(init) {
        let resources = container
            .resources
            .get_or_insert_with(ResourceRequirements::default);
        let lim = resources.limits.get_or_insert_with(BTreeMap::new);
        if quantity_is_zero(lim.get("cpu"), true) || quantity_is_zero(lim.get("memory"), false) {
            lim.insert("cpu".to_string(), limits.cpu_quantity());
            lim.insert("memory".to_string(), limits.memory_quantity());
        }
        let req = resources.requests.get_or_insert_with(BTreeMap::new);
        if quantity_is_zero(req.get("cpu"), true) || quantity_is_zero(req.get("memory"), false) {
            if !req.get("cpu").is_some_and(|q| q.0 == "0") {
                req.insert("cpu".to_string(), Quantity("0".to_string()));
            }
            if !req.get("memory").is_some_and(|q| q.0 == "0") {
                req.insert("memory".to_string(), Quantity("0".to_string()));
            }
        }
    }
}

/// Enforce exact limits on a container, comparing by value.
pub fn enforce_container_limits(container: &mut Container, limits: ResourceAmounts, requests: RequestPolicy) {
    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    set_amounts(resources.limits.get_or_insert_with(BTreeMap::new), limits);
    let req = resources.requests.get_or_insert_with(BTreeMap::new);
    match requests {
        RequestPolicy::MatchLimits => set_amounts(req, limits),
        RequestPolicy::Zero => set_amounts(req, ResourceAmounts::ZERO),
    }
}

fn set_amounts(list: &mut BTreeMap<String, Quantity>, amounts: ResourceAmounts) {
    if !cpu_equals(list.get("cpu"), amounts.cpu_millis) {
        list.insert("cpu".to_string(), amounts.cpu_quantity());
    }
    if !memory_equals(list.get("memory"), amounts.memory_bytes) {
        list.insert("memory".to_string(), amounts.memory_quantity());
    }
}
