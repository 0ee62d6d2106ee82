//! Serving certificate lifecycle and webhook registration against the fake
//! API server, including the races between replicas starting together.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use tenant_admission::config::{DeploymentMode, Settings, TLS_CERT_FILE, TLS_KEY_FILE};
use tenant_admission::webhooks::{CertificateManager, CertificateMaterial, WebhookRegistrar};
use tenant_admission::{HealthState, WebhookError, run_webhook_server};

use crate::fakes::{FakeCluster, Harness};

fn settings(dir: &tempfile::TempDir) -> Settings {
    Settings {
        service_name: "w7panel".to_string(),
        namespace: "platform".to_string(),
        cert_dir: dir.path().join("serving-certs"),
        ..Default::default()
    }
}

fn stored(material: &CertificateMaterial) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("w7panel-webhook-tls".to_string()),
            namespace: Some("platform".to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(material.secret_data()),
        ..Default::default()
    }
}

// ============================================================================
// Certificates
// ============================================================================

#[tokio::test]
async fn test_first_start_creates_and_mirrors_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();

    let material = CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();

    let secret = cluster.secret("platform", "w7panel-webhook-tls").unwrap();
    assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
    assert_eq!(CertificateMaterial::from_secret(&secret).unwrap(), material);
    assert_eq!(
        fs::read_to_string(settings.cert_dir.join(TLS_CERT_FILE)).unwrap(),
        material.cert_pem
    );
    assert_eq!(
        fs::read_to_string(settings.cert_dir.join(TLS_KEY_FILE)).unwrap(),
        material.key_pem
    );
}

#[tokio::test]
async fn test_valid_certificate_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();
    let existing = CertificateMaterial::generate(&settings.service_host()).unwrap();
    cluster.insert_secret(stored(&existing));
    let version = cluster
        .secret("platform", "w7panel-webhook-tls")
        .unwrap()
        .metadata
        .resource_version;

    let material = CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();

    assert_eq!(material, existing);
    let after = cluster.secret("platform", "w7panel-webhook-tls").unwrap();
    assert_eq!(after.metadata.resource_version, version);
}

#[tokio::test]
async fn test_concurrent_create_serves_winner() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();
    let winner = CertificateMaterial::generate(&settings.service_host()).unwrap();
    *cluster.racing_secret.lock().unwrap() = Some(stored(&winner));

    let material = CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();

    assert_eq!(material, winner);
    assert_eq!(
        fs::read_to_string(settings.cert_dir.join(TLS_CERT_FILE)).unwrap(),
        winner.cert_pem
    );
}

#[tokio::test]
async fn test_expiring_certificate_is_rotated_in_place() {
    let dir = tempfile::tempdir().unwrap();
    // every one-year certificate is inside a 400-day window
    let settings = Settings {
        renew_before_days: 400,
        ..settings(&dir)
    };
    let cluster = FakeCluster::new();
    let old = CertificateMaterial::generate(&settings.service_host()).unwrap();
    cluster.insert_secret(stored(&old));
    let before = cluster.secret("platform", "w7panel-webhook-tls").unwrap();

    let material = CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();

    assert_ne!(material.cert_pem, old.cert_pem);
    let after = cluster.secret("platform", "w7panel-webhook-tls").unwrap();
    assert_ne!(after.metadata.resource_version, before.metadata.resource_version);
    assert_eq!(CertificateMaterial::from_secret(&after).unwrap(), material);
}

#[tokio::test]
async fn test_unreadable_certificate_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();
    let mut garbage = stored(&CertificateMaterial {
        cert_pem: String::new(),
        key_pem: String::new(),
        not_after: 0,
    });
    garbage.data = Some(BTreeMap::from([
        (TLS_CERT_FILE.to_string(), ByteString(b"garbage".to_vec())),
        (TLS_KEY_FILE.to_string(), ByteString(b"garbage".to_vec())),
    ]));
    cluster.insert_secret(garbage);

    let material = CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();
    let after = cluster.secret("platform", "w7panel-webhook-tls").unwrap();
    assert_eq!(CertificateMaterial::from_secret(&after).unwrap(), material);
}

// ============================================================================
// Webhook registration
// ============================================================================

fn ca_bundle(config: &MutatingWebhookConfiguration) -> Vec<u8> {
    config.webhooks.as_ref().unwrap()[0]
        .client_config
        .ca_bundle
        .clone()
        .unwrap()
        .0
}

#[tokio::test]
async fn test_registration_creates_both_configurations() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();

    WebhookRegistrar::new(&*cluster, &settings)
        .register(b"CA-1")
        .await
        .unwrap();

    let core = cluster.webhook("w7panel-webhook").unwrap();
    let crd = cluster.webhook("w7panel-crd-webhook").unwrap();
    assert_eq!(ca_bundle(&core), b"CA-1");
    assert_eq!(ca_bundle(&crd), b"CA-1");
}

#[tokio::test]
async fn test_registration_replaces_existing() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();
    let registrar = WebhookRegistrar::new(&*cluster, &settings);

    registrar.register(b"CA-1").await.unwrap();
    registrar.register(b"CA-2").await.unwrap();

    assert_eq!(ca_bundle(&cluster.webhook("w7panel-webhook").unwrap()), b"CA-2");
    assert_eq!(
        ca_bundle(&cluster.webhook("w7panel-crd-webhook").unwrap()),
        b"CA-2"
    );
}

#[tokio::test]
async fn test_registration_survives_concurrent_create() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let cluster = FakeCluster::new();
    let mut racing = MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some("w7panel-webhook".to_string()),
            ..Default::default()
        },
        webhooks: None,
    };
    racing.metadata.labels = Some(BTreeMap::from([("owner".to_string(), "other".to_string())]));
    *cluster.racing_webhook.lock().unwrap() = Some(racing);

    WebhookRegistrar::new(&*cluster, &settings)
        .register(b"CA-3")
        .await
        .unwrap();

    let core = cluster.webhook("w7panel-webhook").unwrap();
    assert_eq!(ca_bundle(&core), b"CA-3");
    assert!(core.metadata.labels.is_none());
}

#[tokio::test]
async fn test_agent_registration_uses_narrow_rules() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        mode: DeploymentMode::Agent,
        ..settings(&dir)
    };
    let cluster = FakeCluster::new();
    WebhookRegistrar::new(&*cluster, &settings)
        .register(b"CA")
        .await
        .unwrap();

    let core = cluster.webhook("w7panel-webhook").unwrap();
    let resources: Vec<String> = core.webhooks.unwrap()[0]
        .rules
        .clone()
        .unwrap()
        .into_iter()
        .flat_map(|r| r.resources.unwrap_or_default())
        .collect();
    assert!(!resources.contains(&"pods".to_string()));
    assert!(resources.contains(&"ingresses".to_string()));
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn test_webhook_ready_only_once_listening() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        port: 0,
        ..settings(&dir)
    };
    let dispatcher = Arc::new(Harness::root().dispatcher());
    let state = Arc::new(HealthState::new());

    // nothing mirrored yet: the server fails and readiness never flips
    let result = run_webhook_server(dispatcher.clone(), &settings, Some(state.clone())).await;
    assert!(matches!(result, Err(WebhookError::TlsConfig(_))));
    assert!(!state.is_ready().await);

    let cluster = FakeCluster::new();
    CertificateManager::new(&*cluster, &settings)
        .ensure()
        .await
        .unwrap();
    let server = {
        let settings = settings.clone();
        let state = state.clone();
        tokio::spawn(async move { run_webhook_server(dispatcher, &settings, Some(state)).await })
    };
    tokio::time::timeout(Duration::from_secs(10), async {
        while !state.is_ready().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    server.abort();
}
