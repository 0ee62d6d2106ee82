//! Tenant identity and quota snapshot.
//!
//! A tenant is represented by a ServiceAccount named after it. Its quota,
//! mode and lifecycle flags live in labels and annotations on that account.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use serde::Deserialize;

use crate::quantity::{GIB, ResourceAmounts, parse_bytes, parse_cpu_millis};

pub const USER_MODE_LABEL: &str = "w7.cc/user-mode";
pub const MAINTENANCE_LABEL: &str = "w7.cc/weihu";
pub const TENANT_NAMESPACE_LABEL: &str = "w7.cc/k3k-namespace";
pub const CLUSTER_MODE_ANNOTATION: &str = "k3k.io/cluster-mode";
pub const PAUSE_ANNOTATION: &str = "w7.cc/pause";
pub const QUOTA_ANNOTATION: &str = "w7.cc/quota-limit";

/// Namespaces holding a tenant's virtual control plane are `k3k-{tenant}`.
pub const TENANT_NAMESPACE_PREFIX: &str = "k3k-";

/// Governance mode of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TenantMode {
    /// Dedicated virtual cluster; workloads get the tenant's hard bounds
    IsolatedVirtual,
    /// Virtual control plane on shared nodes; fixed platform floors
    Shared,
    /// Owns a full cluster and manages its own resources
    ClusterOwner,
    Normal,
}

/// Read-only snapshot of a tenant's quota configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantQuota {
    pub name: String,
    pub mode: TenantMode,
    /// Whether the quota annotation declared a hard section at all
    pub has_hard: bool,
    pub hard: ResourceAmounts,
    /// Per-workload limit bounds for pods without a role
    pub limit: ResourceAmounts,
    pub bandwidth_mbps: i64,
    pub paused: bool,
    pub maintenance: bool,
    /// Namespace hosting the tenant's control plane, when labelled
    pub namespace: Option<String>,
}

impl TenantQuota {
    /// Empty quota of the given mode
    pub fn new(name: impl Into<String>, mode: TenantMode) -> Self {
        Self {
            name: name.into(),
            mode,
            has_hard: false,
            hard: ResourceAmounts::ZERO,
            limit: ResourceAmounts::ZERO,
            bandwidth_mbps: 0,
            paused: false,
            maintenance: false,
            namespace: None,
        }
    }

    /// Build a snapshot from the tenant's identity ServiceAccount.
    ///
    /// An unparseable quota annotation is treated as absent.
    pub fn from_service_account(sa: &ServiceAccount) -> Self {
        let empty = BTreeMap::new();
        let labels = sa.metadata.labels.as_ref().unwrap_or(&empty);
        let annotations = sa.metadata.annotations.as_ref().unwrap_or(&empty);
        let name = sa.metadata.name.clone().unwrap_or_default();

        // only cluster users carry a virtual control plane
        let mode = match labels.get(USER_MODE_LABEL).map(String::as_str) {
            Some("cluster") => match annotations.get(CLUSTER_MODE_ANNOTATION).map(String::as_str) {
                Some("virtual") => TenantMode::IsolatedVirtual,
                Some("shared") => TenantMode::Shared,
                _ => TenantMode::ClusterOwner,
            },
            _ => TenantMode::Normal,
        };

        let mut quota = Self::new(name, mode);
        quota.paused = annotations.get(PAUSE_ANNOTATION).is_some_and(|v| v == "true");
        quota.maintenance = labels.get(MAINTENANCE_LABEL).is_some_and(|v| v == "true");
        quota.namespace = labels.get(TENANT_NAMESPACE_LABEL).cloned();

        if let Some(raw) = annotations.get(QUOTA_ANNOTATION) {
            match serde_json::from_str::<QuotaDocument>(raw) {
                Ok(doc) => quota.apply(doc),
                Err(e) => {
                    tracing::warn!(tenant = %quota.name, error = %e, "Ignoring malformed quota annotation");
                }
            }
        }
        quota
    }

    fn apply(&mut self, doc: QuotaDocument) {
        if let Some(hard) = doc.hard {
            self.has_hard = true;
            self.hard = ResourceAmounts::new(
                hard.cpu.as_ref().and_then(Amount::cpu_millis).unwrap_or(0),
                hard.memory.as_ref().and_then(Amount::memory_bytes).unwrap_or(0),
            );
            self.bandwidth_mbps = hard.bandwidth.as_ref().and_then(Amount::mbps).unwrap_or(0);
        }
        if let Some(limit) = doc.limit {
            self.limit = ResourceAmounts::new(
                limit.cpu.as_ref().and_then(Amount::cpu_millis).unwrap_or(0),
                limit.memory.as_ref().and_then(Amount::memory_bytes).unwrap_or(0),
            );
        }
    }

    /// Control-plane namespace, labelled or derived from the tenant name
    pub fn control_plane_namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| format!("{}{}", TENANT_NAMESPACE_PREFIX, self.name))
    }

    /// Whether the quota-relevant parts differ in a way that needs a restart.
    ///
    /// Only meaningful when the newer snapshot declares a hard section.
    pub fn resources_changed(&self, newer: &TenantQuota) -> bool {
        if !newer.has_hard || !self.has_hard {
            return false;
        }
        self.hard != newer.hard || self.bandwidth_mbps != newer.bandwidth_mbps
    }
}

/// Tenant owning a namespace, if it is a tenant control-plane namespace.
pub fn tenant_for_namespace(namespace: &str) -> Option<&str> {
    namespace
        .strip_prefix(TENANT_NAMESPACE_PREFIX)
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Deserialize)]
struct QuotaDocument {
    #[serde(default)]
    hard: Option<HardSection>,
    #[serde(default)]
    limit: Option<LimitSection>,
}

#[derive(Debug, Deserialize)]
struct HardSection {
    cpu: Option<Amount>,
    memory: Option<Amount>,
    bandwidth: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct LimitSection {
    cpu: Option<Amount>,
    memory: Option<Amount>,
}

/// Quota values are either bare numbers (cores, Gi, Mbps) or quantity strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Amount {
    Number(f64),
    Text(String),
}

impl Amount {
    fn cpu_millis(&self) -> Option<i64> {
        match self {
            Amount::Number(n) => parse_cpu_millis(&n.to_string()),
            Amount::Text(s) => parse_cpu_millis(s),
        }
    }

    fn memory_bytes(&self) -> Option<i64> {
        let gib = |n: f64| Some((n * GIB as f64).round() as i64);
        match self {
            Amount::Number(n) => gib(*n),
            // legacy documents wrote "4G" meaning 4Gi
            Amount::Text(s) => match s.trim().trim_end_matches('G').parse::<f64>() {
                Ok(n) => gib(n),
                Err(_) => parse_bytes(s.trim()),
            },
        }
    }

    fn mbps(&self) -> Option<i64> {
        match self {
            Amount::Number(n) => Some(n.round() as i64),
            Amount::Text(s) => s
                .trim()
                .trim_end_matches("Mbps")
                .trim_end_matches("Mi")
                .trim_end_matches('M')
                .parse::<f64>()
                .ok()
                .map(|n| n.round() as i64),
        }
    }
}
