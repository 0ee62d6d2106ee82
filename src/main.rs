//! tenant-admission - mutating admission webhook for tenant resource governance.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Ensures the serving certificate and webhook registrations
//! - Starts the health server and the webhook server

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tracing::{error, info};

use tenant_admission::cluster::{ClusterApi, KubeCluster};
use tenant_admission::health::{HealthState, run_health_server};
use tenant_admission::hooks::HttpPlatformHooks;
use tenant_admission::imaging::RegistryClient;
use tenant_admission::mutators::Services;
use tenant_admission::scheduler::TokioScheduler;
use tenant_admission::webhooks::{CertificateManager, WebhookRegistrar};
use tenant_admission::{Dispatcher, Settings, run_webhook_server};

/// Grace period for in-flight admission requests during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenant_admission=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    // another component may already have installed one
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let settings = Arc::new(Settings::from_env()?);
    info!(
        service = %settings.service_name,
        namespace = %settings.namespace,
        mode = ?settings.mode,
        "Starting tenant-admission"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client));

    let health_state = Arc::new(HealthState::new());

    // Start health server immediately so liveness works during setup
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Without a certificate and registration there is nothing to serve
    let material = CertificateManager::new(cluster.as_ref(), &settings)
        .ensure()
        .await?;
    WebhookRegistrar::new(cluster.as_ref(), &settings)
        .register(material.cert_pem.as_bytes())
        .await?;

    let services = Services {
        cluster,
        hooks: Arc::new(HttpPlatformHooks::new(settings.hook_endpoint.clone())?),
        resolver: Arc::new(RegistryClient::new()?),
        settings: settings.clone(),
    };
    let scheduler = Arc::new(TokioScheduler::new(Some(health_state.clone())));
    let dispatcher = Arc::new(
        Dispatcher::with_default_routes(services, scheduler).with_health_state(health_state.clone()),
    );

    // readiness flips once the TLS listener is bound
    let webhook_handle = {
        let settings = settings.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move { run_webhook_server(dispatcher, &settings, Some(health_state)).await })
    };

    tokio::select! {
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = webhook_handle => {
            health_state.set_ready(false).await;
            if let Err(e) = result? {
                error!("Webhook server error: {}", e);
                return Err(e.into());
            }
            return Err("webhook server stopped unexpectedly".into());
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            info!(
                "Waiting {}s for in-flight admission requests to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("tenant-admission stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; there is no graceful shutdown
/// without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
