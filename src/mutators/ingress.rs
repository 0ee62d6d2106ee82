//! Ingress lifecycle: redirect annotation, gateway sync and TLS secret cleanup.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};
use tracing::{debug, info, warn};

use super::{MutationContext, Mutator, decode_object, decode_old_object};
use crate::cluster::ClusterApi;
use crate::error::{AdmissionError, Result};
use crate::hooks::IngressEvent;
use crate::webhooks::Decision;

pub const SSL_REDIRECT_ANNOTATION: &str = "w7.cc/ssl-redirect";
pub const GATEWAY_SSL_REDIRECT_ANNOTATION: &str = "higress.io/ssl-redirect";

const SYNC_DELAY: Duration = Duration::from_secs(2);

pub struct IngressMutator;

#[async_trait]
impl Mutator for IngressMutator {
    async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        ctx: &MutationContext,
    ) -> std::result::Result<Decision, AdmissionError> {
        let (event, current) = match request.operation {
            Operation::Delete => {
                let ingress: Ingress = decode_old_object(request)?;
                (
                    IngressEvent::Deleted {
                        ingress: Box::new(ingress.clone()),
                    },
                    ingress,
                )
            }
            Operation::Update => {
                let old: Ingress = decode_old_object(request)?;
                let new: Ingress = decode_object(request)?;
                (
                    IngressEvent::Updated {
                        old: Box::new(old),
                        new: Box::new(new.clone()),
                    },
                    new,
                )
            }
            _ => {
                let ingress: Ingress = decode_object(request)?;
                (
                    IngressEvent::Added {
                        ingress: Box::new(ingress.clone()),
                    },
                    ingress,
                )
            }
        };

        let hooks = ctx.hooks.clone();
        ctx.defer("sync-ingress", SYNC_DELAY, async move {
            hooks.sync_ingress(&event).await
        });

        if !ctx.settings.is_root() {
            let hooks = ctx.hooks.clone();
            let object = serde_json::to_value(&current)
                .map_err(|e| AdmissionError::Internal(format!("encode ingress: {}", e)))?;
            ctx.defer("sync-ingress-to-parent", Duration::ZERO, async move {
                hooks.sync_to_parent("sync-ingress", &object).await
            });
        }

        if request.operation == Operation::Delete {
            let cluster = ctx.cluster.clone();
            ctx.defer("release-tls-secrets", Duration::ZERO, async move {
                release_tls_secrets(cluster, &current).await
            });
            return Ok(Decision::allowed("ingress deletion"));
        }

        if !ctx.settings.is_root() {
            return Ok(Decision::allowed("ingress accepted"));
        }
        let mut ingress = current.clone();
        if let Some(annotations) = ingress.metadata.annotations.as_mut() {
            if let Some(redirect) = annotations.get(SSL_REDIRECT_ANNOTATION).cloned() {
                if annotations.get(GATEWAY_SSL_REDIRECT_ANNOTATION) != Some(&redirect) {
                    annotations.insert(GATEWAY_SSL_REDIRECT_ANNOTATION.to_string(), redirect);
                }
            }
        }
        Decision::from_diff(
            &current,
            &ingress,
            "ingress needs no changes",
            "gateway redirect annotation set",
        )
    }
}

fn tls_secrets(ingress: &Ingress) -> BTreeSet<String> {
    ingress
        .spec
        .iter()
        .flat_map(|s| s.tls.iter().flatten())
        .filter_map(|t| t.secret_name.clone())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Delete the TLS secrets of a removed ingress that no sibling still uses.
///
/// A failed listing deletes nothing. A failed delete is logged and the
/// remaining secrets are still released.
pub async fn release_tls_secrets(cluster: Arc<dyn ClusterApi>, deleted: &Ingress) -> Result<()> {
    let candidates = tls_secrets(deleted);
    if candidates.is_empty() {
        return Ok(());
    }
    let namespace = deleted.metadata.namespace.clone().unwrap_or_default();
    let name = deleted.metadata.name.clone().unwrap_or_default();

    let siblings = cluster.list_ingresses(&namespace).await?;
    let referenced: BTreeSet<String> = siblings
        .iter()
        .filter(|i| i.metadata.name.as_deref() != Some(name.as_str()))
        .flat_map(tls_secrets)
        .collect();

    for secret in candidates {
        if referenced.contains(&secret) {
            debug!(namespace = %namespace, secret = %secret, "TLS secret still referenced");
            continue;
        }
        match cluster.delete_secret(&namespace, &secret).await {
            Ok(()) => {
                info!(namespace = %namespace, secret = %secret, "Deleted unreferenced TLS secret")
            }
            Err(e) => {
                warn!(namespace = %namespace, secret = %secret, error = %e, "Failed to delete TLS secret")
            }
        }
    }
    Ok(())
}
