//! Admission review and object builders.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use serde_json::{Value, json};

use tenant_admission::Decision;
use tenant_admission::tenant::{
    CLUSTER_MODE_ANNOTATION, MAINTENANCE_LABEL, PAUSE_ANNOTATION, QUOTA_ANNOTATION,
    USER_MODE_LABEL,
};

/// Group / version / kind / resource of a routed type.
#[derive(Clone, Copy)]
pub struct Target {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub resource: &'static str,
}

const fn target(
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    resource: &'static str,
) -> Target {
    Target {
        group,
        version,
        kind,
        resource,
    }
}

pub const PODS: Target = target("", "v1", "Pod", "pods");
pub const SERVICES: Target = target("", "v1", "Service", "services");
pub const SECRETS: Target = target("", "v1", "Secret", "secrets");
pub const CONFIGMAPS: Target = target("", "v1", "ConfigMap", "configmaps");
pub const SERVICE_ACCOUNTS: Target = target("", "v1", "ServiceAccount", "serviceaccounts");
pub const NODES: Target = target("", "v1", "Node", "nodes");
pub const DEPLOYMENTS: Target = target("apps", "v1", "Deployment", "deployments");
pub const STATEFULSETS: Target = target("apps", "v1", "StatefulSet", "statefulsets");
pub const DAEMONSETS: Target = target("apps", "v1", "DaemonSet", "daemonsets");
pub const INGRESSES: Target = target("networking.k8s.io", "v1", "Ingress", "ingresses");
pub const STORAGE_CLASSES: Target = target("storage.k8s.io", "v1", "StorageClass", "storageclasses");
pub const LONGHORN_NODES: Target = target("longhorn.io", "v1beta2", "Node", "nodes");
pub const LONGHORN_REPLICAS: Target = target("longhorn.io", "v1beta2", "Replica", "replicas");
pub const POLICIES: Target = target(
    "k3k.io",
    "v1alpha1",
    "VirtualClusterPolicy",
    "virtualclusterpolicies",
);
pub const TENANT_CLUSTERS: Target = target("k3k.io", "v1alpha1", "Cluster", "clusters");
pub const APP_CLUSTERS: Target = target("apps.kubeblocks.io", "v1alpha1", "Cluster", "clusters");
pub const MCP_BRIDGES: Target = target("networking.higress.io", "v1", "McpBridge", "mcpbridges");
pub const JOBS: Target = target("batch", "v1", "Job", "jobs");

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn build(
    target: Target,
    operation: &str,
    object: Option<&Value>,
    old_object: Option<&Value>,
) -> Value {
    let meta = object.or(old_object).map(|o| &o["metadata"]);
    let name = meta.and_then(|m| m["name"].as_str()).unwrap_or_default();
    let namespace = meta.and_then(|m| m["namespace"].as_str());
    let uid = format!("req-{}", NEXT_UID.fetch_add(1, Ordering::SeqCst));
    let mut request = json!({
        "uid": uid,
        "kind": {"group": target.group, "version": target.version, "kind": target.kind},
        "resource": {"group": target.group, "version": target.version, "resource": target.resource},
        "name": name,
        "operation": operation,
        "userInfo": {"username": "system:serviceaccount:platform:tester"},
        "object": object.cloned().unwrap_or(Value::Null),
        "oldObject": old_object.cloned().unwrap_or(Value::Null),
        "dryRun": false
    });
    if let Some(ns) = namespace {
        request["namespace"] = json!(ns);
    }
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": request
    })
}

fn parse(raw: Value) -> AdmissionReview<DynamicObject> {
    serde_json::from_value(raw).expect("valid AdmissionReview fixture")
}

pub fn create(target: Target, object: &Value) -> AdmissionReview<DynamicObject> {
    parse(build(target, "CREATE", Some(object), None))
}

pub fn update(target: Target, old: &Value, new: &Value) -> AdmissionReview<DynamicObject> {
    parse(build(target, "UPDATE", Some(new), Some(old)))
}

pub fn delete(target: Target, old: &Value) -> AdmissionReview<DynamicObject> {
    parse(build(target, "DELETE", None, Some(old)))
}

/// Raw review JSON, for tests that need to corrupt it.
pub fn raw_create(target: Target, object: &Value) -> Value {
    build(target, "CREATE", Some(object), None)
}

pub fn request_of(review: AdmissionReview<DynamicObject>) -> AdmissionRequest<DynamicObject> {
    review.try_into().expect("review carries a request")
}

/// Serialized `response` section of a review.
pub fn response_json(review: &AdmissionReview<DynamicObject>) -> Value {
    let value = serde_json::to_value(review).expect("review serializes");
    value["response"].clone()
}

/// Apply a patched decision to `object`; other decisions leave it as is.
pub fn apply_decision(object: &Value, decision: &Decision) -> Value {
    let mut out = object.clone();
    if let Decision::Patched { patch, .. } = decision {
        json_patch::patch(&mut out, patch).expect("patch applies to the submitted object");
    }
    out
}

// ============================================================================
// Objects
// ============================================================================

pub fn pod(namespace: &str, name: &str, labels: Value, annotations: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": annotations
        },
        "spec": {
            "containers": [{"name": "app", "image": "nginx:1.25"}]
        }
    })
}

pub fn statefulset(namespace: &str, name: &str, labels: Value, annotations: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": annotations
        },
        "spec": {
            "replicas": 1,
            "serviceName": name,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "k3s", "image": "rancher/k3s:v1.30.2-k3s1"}]}
            }
        }
    })
}

pub fn deployment(namespace: &str, name: &str, labels: Value, annotations: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": annotations
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{
                    "name": "web",
                    "image": "nginx:1.25",
                    "imagePullPolicy": "Always"
                }]}
            }
        }
    })
}

pub fn daemonset(namespace: &str, name: &str, labels: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {"name": name, "namespace": namespace, "labels": labels},
        "spec": {
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "agent", "image": "rancher/k3s:v1.30.2-k3s1"}]}
            }
        }
    })
}

pub fn ingress(namespace: &str, name: &str, annotations: Value, tls_secrets: &[&str]) -> Value {
    let tls: Vec<Value> = tls_secrets
        .iter()
        .map(|s| json!({"hosts": ["example.com"], "secretName": s}))
        .collect();
    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {"name": name, "namespace": namespace, "annotations": annotations},
        "spec": {
            "tls": tls,
            "rules": [{"host": "example.com"}]
        }
    })
}

/// Identity account of a tenant.
pub struct Tenant {
    pub name: &'static str,
    pub cluster_mode: Option<&'static str>,
    pub quota: Option<Value>,
    pub paused: bool,
    pub maintenance: bool,
}

impl Tenant {
    pub fn virtual_tenant(name: &'static str, quota: Value) -> Self {
        Self {
            name,
            cluster_mode: Some("virtual"),
            quota: Some(quota),
            paused: false,
            maintenance: false,
        }
    }

    pub fn shared_tenant(name: &'static str, quota: Value) -> Self {
        Self {
            cluster_mode: Some("shared"),
            ..Self::virtual_tenant(name, quota)
        }
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn maintenance(mut self) -> Self {
        self.maintenance = true;
        self
    }

    pub fn account(&self) -> ServiceAccount {
        let mut labels = BTreeMap::from([(USER_MODE_LABEL.to_string(), "cluster".to_string())]);
        if self.maintenance {
            labels.insert(MAINTENANCE_LABEL.to_string(), "true".to_string());
        }
        let mut annotations = BTreeMap::new();
        if let Some(mode) = self.cluster_mode {
            annotations.insert(CLUSTER_MODE_ANNOTATION.to_string(), mode.to_string());
        }
        if let Some(quota) = &self.quota {
            annotations.insert(QUOTA_ANNOTATION.to_string(), quota.to_string());
        }
        if self.paused {
            annotations.insert(PAUSE_ANNOTATION.to_string(), "true".to_string());
        }
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn account_json(&self) -> Value {
        serde_json::to_value(self.account()).expect("service account serializes")
    }
}
