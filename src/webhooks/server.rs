//! Admission webhook HTTPS server.
//!
//! Serves `POST /mutate` with the certificate mirrored by the certificate
//! manager. Bodies are parsed by hand so a malformed review still gets an
//! `AdmissionReview` back rather than axum's plain-text rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use thiserror::Error;
use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::registration::MUTATE_PATH;
use crate::config::Settings;
use crate::health::HealthState;

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}

/// Create the webhook router
pub fn create_webhook_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate))
        .with_state(dispatcher)
}

async fn mutate(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> impl IntoResponse {
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "Failed to parse AdmissionReview");
            return (
                StatusCode::BAD_REQUEST,
                Json(AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e)).into_review()),
            );
        }
    };
    let (status, review) = dispatcher.review(review).await;
    (status, Json(review))
}

/// Run the webhook server with TLS until it fails.
///
/// `ready` is marked ready once the listener is bound, never before.
pub async fn run_webhook_server(
    dispatcher: Arc<Dispatcher>,
    settings: &Settings,
    ready: Option<Arc<HealthState>>,
) -> Result<(), WebhookError> {
    let app = create_webhook_router(dispatcher);

    let config = RustlsConfig::from_pem_file(settings.cert_path(), settings.key_path())
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let handle = Handle::new();
    if let Some(state) = ready {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Some(bound) = handle.listening().await {
                info!(addr = %bound, "Webhook server listening with TLS");
                state.set_ready(true).await;
            }
        });
    }

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
