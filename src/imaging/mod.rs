//! Image digest pinning.
//!
//! Rewrites mutable tag references of opted-in workloads to immutable
//! `repo@sha256:...` references. The tag reference is kept in an
//! annotation so the pin can be refreshed when the upstream tag moves, or
//! reverted by hand.

mod registry;

pub use registry::{BasicAuth, RegistryClient, RegistryCredentials, parse_challenge};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::resources::workload::WorkloadKind;

/// Workload annotation opting into digest pinning
pub const PIN_ANNOTATION: &str = "w7.cc/image-to-sha256";
/// Prefix of the per-container annotation holding the tag reference
pub const ORIGIN_IMAGE_PREFIX: &str = "origin-image-";

const DOCKER_HUB: &str = "docker.io";

/// Resolves an image reference to its current manifest digest.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, image: &ImageReference, credentials: &RegistryCredentials)
    -> Result<String>;
}

/// Parsed container image reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository as written by the user, without tag or digest
    pub name: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            return Err(Error::Registry(format!("invalid image reference '{}'", raw)));
        }

        let (rest, digest) = match raw.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(Error::Registry(format!("invalid digest in '{}'", raw)));
                }
                (rest, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // a colon after the last slash separates the tag; earlier ones are ports
        let (name, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag.to_string())),
            _ => (rest, None),
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(Error::Registry(format!("invalid image reference '{}'", raw)));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (normalize_registry(host), path.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{}", name)),
        };

        Ok(Self {
            name: name.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Manifest reference to query: digest, tag, or `latest`
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Same repository pinned to `digest`
    pub fn pinned(&self, digest: &str) -> String {
        format!("{}@{}", self.name, digest)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Canonical host for credential lookup and API calls.
pub(crate) fn normalize_registry(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DOCKER_HUB.to_string()
        }
        other => other.to_string(),
    }
}

/// Per-container pinning state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerImage {
    pub image: String,
    /// Tag reference saved by an earlier pin
    pub annotation_image: Option<String>,
}

/// New live reference and annotation value for a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinnedImage {
    pub image: String,
    pub annotation_image: String,
}

/// Compute the pinned reference for one container, if it should change.
pub async fn pin_container(
    current: &ContainerImage,
    resolver: &dyn DigestResolver,
    credentials: &RegistryCredentials,
) -> Result<Option<PinnedImage>> {
    let live = ImageReference::parse(&current.image)?;
    if !live.is_pinned() {
        let digest = resolver.resolve(&live, credentials).await?;
        return Ok(Some(PinnedImage {
            image: live.pinned(&digest),
            annotation_image: current.image.clone(),
        }));
    }

    let Some(original) = current.annotation_image.as_deref().filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let original_ref = ImageReference::parse(original)?;
    if original_ref.is_pinned() {
        return Ok(None);
    }
    let digest = resolver.resolve(&original_ref, credentials).await?;
    if live.digest.as_deref() == Some(digest.as_str()) {
        return Ok(None);
    }
    Ok(Some(PinnedImage {
        image: original_ref.pinned(&digest),
        annotation_image: original.to_string(),
    }))
}

/// Load registry credentials from the workload's image pull secrets.
async fn load_credentials(
    cluster: &dyn ClusterApi,
    namespace: &str,
    secret_names: &[String],
) -> RegistryCredentials {
    let mut credentials = RegistryCredentials::default();
    for name in secret_names {
        match cluster.get_secret(namespace, name).await {
            Ok(Some(secret)) => merge_secret(&mut credentials, &secret, name),
            Ok(None) => warn!(namespace, secret = %name, "Image pull secret not found"),
            Err(e) => warn!(namespace, secret = %name, error = %e, "Failed to read image pull secret"),
        }
    }
    credentials
}

fn merge_secret(credentials: &mut RegistryCredentials, secret: &Secret, name: &str) {
    let Some(data) = &secret.data else {
        return;
    };
    for key in [".dockerconfigjson", ".dockercfg"] {
        if let Some(bytes) = data.get(key) {
            if let Err(e) = credentials.merge_docker_config(&bytes.0) {
                warn!(secret = %name, error = %e, "Ignoring malformed docker config");
            }
        }
    }
}

/// Re-read a workload and pin the images of its `Always`-pulled containers.
///
/// Runs inside the scheduler, never on the admission path.
pub async fn pin_workload_images(
    cluster: &dyn ClusterApi,
    resolver: &dyn DigestResolver,
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let Some(mut workload) = cluster.get_workload(kind, namespace, name).await? else {
        debug!(%kind, namespace, name, "Workload gone before pinning");
        return Ok(());
    };
    if workload.annotation(PIN_ANNOTATION) != Some("true") {
        return Ok(());
    }

    let annotations = workload.metadata().annotations.clone().unwrap_or_default();
    let secret_names: Vec<String> = workload
        .pod_spec()
        .and_then(|s| s.image_pull_secrets.as_ref())
        .map(|refs| refs.iter().map(|r| r.name.clone()).collect())
        .unwrap_or_default();
    let credentials = load_credentials(cluster, namespace, &secret_names).await;

    let mut updates = Vec::new();
    if let Some(spec) = workload.pod_spec_mut() {
        for container in spec.containers.iter_mut() {
            if container.image_pull_policy.as_deref() != Some("Always") {
                continue;
            }
            let Some(image) = container.image.clone() else {
                continue;
            };
            let key = format!("{}{}", ORIGIN_IMAGE_PREFIX, container.name);
            let current = ContainerImage {
                image,
                annotation_image: annotations.get(&key).cloned(),
            };
            match pin_container(&current, resolver, &credentials).await {
                Ok(Some(pinned)) => {
                    info!(%kind, namespace, name, container = %container.name, image = %pinned.image, "Pinning image digest");
                    container.image = Some(pinned.image);
                    updates.push((key, pinned.annotation_image));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%kind, namespace, name, container = %container.name, error = %e, "Failed to resolve image digest");
                }
            }
        }
    }

    if updates.is_empty() {
        return Ok(());
    }
    workload.annotations_mut().extend(updates);
    cluster.replace_workload(&workload).await
}
