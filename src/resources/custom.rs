//! Custom resources observed by the admission engine.
//!
//! These are partial representations: only the fields the mutators read or
//! write are typed, everything else is carried through untouched.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Longhorn storage-engine Node (longhorn.io/v1beta2)
// ============================================================================

pub const LONGHORN_GROUP: &str = "longhorn.io";
pub const LONGHORN_VERSION: &str = "v1beta2";
pub const LONGHORN_NAMESPACE: &str = "longhorn-system";

/// Storage-engine node holding the disks scheduled on a cluster node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornNode {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LonghornNodeSpec,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornNodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<BTreeMap<String, LonghornDisk>>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

// ============================================================================
// VirtualClusterPolicy (k3k.io/v1alpha1)
// ============================================================================

pub const K3K_GROUP: &str = "k3k.io";

/// Tenant placement policy published to the platform catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterPolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
}

// ============================================================================
// Other groups routed by (kind, group)
// ============================================================================

pub const KUBEBLOCKS_GROUP: &str = "apps.kubeblocks.io";
pub const HIGRESS_GROUP: &str = "networking.higress.io";
