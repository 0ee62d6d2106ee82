//! Pod governance through the dispatcher.

use axum::http::StatusCode;
use serde_json::{Value, json};

use tenant_admission::Decision;
use tenant_admission::config::Settings;
use tenant_admission::governance::{EGRESS_BANDWIDTH_ANNOTATION, INGRESS_BANDWIDTH_ANNOTATION};
use tenant_admission::mutators::{CREATE_POD_ANNOTATION, PAUSED_MESSAGE};
use tenant_admission::quantity::{GIB, ResourceAmounts};

use crate::fakes::Harness;
use crate::fixtures::{self, PODS, Tenant, apply_decision, response_json};

fn harness_with(tenant: Tenant) -> Harness {
    let h = Harness::root();
    h.cluster.add_service_account("default", tenant.account());
    h
}

fn server_pod() -> Value {
    fixtures::pod("k3k-acme", "acme-server-0", json!({"role": "server"}), json!({}))
}

fn plain_pod() -> Value {
    fixtures::pod("k3k-acme", "web-0", json!({"app": "web"}), json!({}))
}

fn resources(pod: &Value) -> &Value {
    &pod["spec"]["containers"][0]["resources"]
}

#[tokio::test]
async fn test_virtual_server_gets_hard_bounds() {
    let h = harness_with(Tenant::virtual_tenant(
        "acme",
        json!({"hard": {"cpu": 2, "memory": 4}}),
    ));
    let pod = server_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &decision);

    assert!(matches!(decision, Decision::Patched { .. }));
    assert_eq!(resources(&patched)["limits"]["cpu"], "2");
    assert_eq!(resources(&patched)["limits"]["memory"], "4Gi");
    assert_eq!(resources(&patched)["requests"]["cpu"], "0");
    assert_eq!(resources(&patched)["requests"]["memory"], "0");
    assert_eq!(h.cluster.allocatable_reads.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_virtual_plain_pod_is_left_alone() {
    let h = harness_with(Tenant::virtual_tenant(
        "acme",
        json!({"hard": {"cpu": 2, "memory": 4}}),
    ));
    let (decision, _) = h.decide(fixtures::create(PODS, &plain_pod())).await;
    assert!(matches!(decision, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_shared_tenant_floors() {
    let h = harness_with(Tenant::shared_tenant(
        "acme",
        json!({"hard": {"cpu": 8, "memory": 16}}),
    ));

    let server = server_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &server)).await;
    let patched = apply_decision(&server, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "500m");
    assert_eq!(resources(&patched)["limits"]["memory"], "1Gi");
    assert_eq!(resources(&patched)["requests"]["cpu"], "0");
    assert_eq!(resources(&patched)["requests"]["memory"], "0");

    let agent = fixtures::pod("k3k-acme", "acme-agent", json!({"role": "agent"}), json!({}));
    let (decision, _) = h.decide(fixtures::create(PODS, &agent)).await;
    let patched = apply_decision(&agent, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "100m");
    assert_eq!(resources(&patched)["limits"]["memory"], "100Mi");
    assert_eq!(resources(&patched)["requests"]["cpu"], "0");
    assert_eq!(resources(&patched)["requests"]["memory"], "0");

    let plain = plain_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &plain)).await;
    let patched = apply_decision(&plain, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "250m");
    assert_eq!(resources(&patched)["limits"]["memory"], "500Mi");
    assert_eq!(resources(&patched)["requests"]["cpu"], "0");
    assert_eq!(resources(&patched)["requests"]["memory"], "0");
}

#[tokio::test]
async fn test_shared_plain_pod_uses_tenant_limit_section() {
    let h = harness_with(Tenant::shared_tenant(
        "acme",
        json!({"hard": {"cpu": 8, "memory": 16}, "limit": {"cpu": "2", "memory": "3Gi"}}),
    ));
    let plain = plain_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &plain)).await;
    let patched = apply_decision(&plain, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "2");
    assert_eq!(resources(&patched)["limits"]["memory"], "3Gi");
}

#[tokio::test]
async fn test_zero_hard_reads_cluster_capacity() {
    let h = harness_with(Tenant::virtual_tenant(
        "acme",
        json!({"hard": {"cpu": 0, "memory": 0}}),
    ));
    h.cluster
        .set_allocatable(ResourceAmounts::new(8_000, 16 * GIB));

    let pod = server_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "8");
    assert_eq!(resources(&patched)["limits"]["memory"], "16Gi");
    assert_eq!(h.cluster.allocatable_reads.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_maintenance_doubles_capacity() {
    let h = harness_with(
        Tenant::virtual_tenant("acme", json!({"hard": {"cpu": 0, "memory": 0}})).maintenance(),
    );
    h.cluster
        .set_allocatable(ResourceAmounts::new(8_000, 16 * GIB));

    let pod = server_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &decision);
    assert_eq!(resources(&patched)["limits"]["cpu"], "16");
    assert_eq!(resources(&patched)["limits"]["memory"], "32Gi");
}

#[tokio::test]
async fn test_bandwidth_annotations_for_any_mode() {
    let h = harness_with(Tenant::virtual_tenant(
        "acme",
        json!({"hard": {"cpu": 2, "memory": 4, "bandwidth": 100}}),
    ));
    let pod = plain_pod();
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &decision);
    let annotations = &patched["metadata"]["annotations"];
    assert_eq!(annotations[INGRESS_BANDWIDTH_ANNOTATION], "100M");
    assert_eq!(annotations[EGRESS_BANDWIDTH_ANNOTATION], "100M");
    // unlabelled pods of a virtual tenant carry no limits
    assert!(resources(&patched).is_null());
}

#[tokio::test]
async fn test_paused_tenant_denies_create() {
    let h = harness_with(
        Tenant::virtual_tenant("acme", json!({"hard": {"cpu": 2, "memory": 4}})).paused(),
    );
    let (status, review) = h.review(fixtures::create(PODS, &server_pod())).await;
    let response = response_json(&review);

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["allowed"], false);
    assert_eq!(response["status"]["message"], PAUSED_MESSAGE);
}

#[tokio::test]
async fn test_paused_tenant_allows_update() {
    let h = harness_with(
        Tenant::virtual_tenant("acme", json!({"hard": {"cpu": 2, "memory": 4}})).paused(),
    );
    let pod = server_pod();
    let (decision, _) = h.decide(fixtures::update(PODS, &pod, &pod)).await;
    assert!(!decision.is_denied());
}

#[tokio::test]
async fn test_create_pod_gate_denies_outside_tenants() {
    let h = Harness::root();
    let pod = fixtures::pod(
        "default",
        "gated",
        json!({}),
        json!({CREATE_POD_ANNOTATION: "false"}),
    );
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    assert_eq!(decision, Decision::denied(PAUSED_MESSAGE));
}

#[tokio::test]
async fn test_unknown_tenant_is_allowed() {
    let h = Harness::root();
    let (decision, _) = h.decide(fixtures::create(PODS, &server_pod())).await;
    assert!(matches!(decision, Decision::Allowed(_)));

    let outside = fixtures::pod("default", "web", json!({"role": "server"}), json!({}));
    let (decision, _) = h.decide(fixtures::create(PODS, &outside)).await;
    assert!(matches!(decision, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_agent_mode_skips_governance() {
    let h = Harness::agent();
    h.cluster.add_service_account(
        "default",
        Tenant::virtual_tenant("acme", json!({"hard": {"cpu": 2, "memory": 4}})).account(),
    );
    let (decision, _) = h.decide(fixtures::create(PODS, &server_pod())).await;
    assert!(matches!(decision, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_declared_limits_are_kept() {
    let h = harness_with(Tenant::shared_tenant(
        "acme",
        json!({"hard": {"cpu": 8, "memory": 16}}),
    ));
    let mut pod = plain_pod();
    pod["spec"]["containers"][0]["resources"] = json!({
        "limits": {"cpu": "3", "memory": "2Gi"},
        "requests": {"cpu": "1", "memory": "1Gi"}
    });
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    assert!(matches!(decision, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_governed_pod_converges() {
    let h = harness_with(Tenant::shared_tenant(
        "acme",
        json!({"hard": {"cpu": 8, "memory": 16, "bandwidth": 20}}),
    ));
    let pod = server_pod();
    let (first, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &first);

    let (second, _) = h.decide(fixtures::create(PODS, &patched)).await;
    assert!(matches!(second, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_lxcfs_views_are_mounted_once() {
    let h = Harness::new(Settings {
        lxcfs_enabled: true,
        ..Default::default()
    });
    let pod = fixtures::pod("default", "web", json!({}), json!({}));
    let (decision, _) = h.decide(fixtures::create(PODS, &pod)).await;
    let patched = apply_decision(&pod, &decision);

    let volumes = patched["spec"]["volumes"].as_array().unwrap();
    let mounts = patched["spec"]["containers"][0]["volumeMounts"]
        .as_array()
        .unwrap();
    assert_eq!(volumes.len(), 8);
    assert_eq!(mounts.len(), 8);
    assert!(
        mounts
            .iter()
            .any(|m| m["mountPath"] == "/proc/meminfo" && m["readOnly"] == true)
    );
    assert!(
        volumes
            .iter()
            .any(|v| v["hostPath"]["path"] == "/var/lib/lxcfs/proc/meminfo")
    );

    let (again, _) = h.decide(fixtures::create(PODS, &patched)).await;
    assert!(matches!(again, Decision::Allowed(_)));
}

#[tokio::test]
async fn test_pod_delete_is_allowed() {
    let h = Harness::root();
    let (decision, tasks) = h.decide(fixtures::delete(PODS, &server_pod())).await;
    assert!(matches!(decision, Decision::Allowed(_)));
    assert!(tasks.is_empty());
}
