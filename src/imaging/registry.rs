//! Minimal OCI distribution client: resolves a manifest digest with a HEAD
//! request, answering bearer or basic auth challenges.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde::Deserialize;
use tracing::debug;

use super::{DigestResolver, ImageReference, normalize_registry};
use crate::error::{Error, Result};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "docker-content-digest";

/// Username and password for one registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Registry credentials keyed by canonical registry host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    auths: HashMap<String, BasicAuth>,
}

#[derive(Deserialize)]
struct DockerConfig {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
}

impl RegistryCredentials {
    pub fn insert(&mut self, registry: &str, auth: BasicAuth) {
        self.auths.insert(registry_key(registry), auth);
    }

    pub fn for_registry(&self, registry: &str) -> Option<&BasicAuth> {
        self.auths.get(&registry_key(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// Merge a `.dockerconfigjson` (or legacy `.dockercfg`) document.
    pub fn merge_docker_config(&mut self, raw: &[u8]) -> Result<()> {
        let entries = match serde_json::from_slice::<DockerConfig>(raw) {
            Ok(config) => config.auths,
            Err(_) => serde_json::from_slice::<HashMap<String, DockerAuthEntry>>(raw)?,
        };
        for (registry, entry) in entries {
            if let Some(auth) = entry.into_basic_auth() {
                self.insert(&registry, auth);
            }
        }
        Ok(())
    }
}

impl DockerAuthEntry {
    fn into_basic_auth(self) -> Option<BasicAuth> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Some(BasicAuth { username, password });
        }
        let decoded = STANDARD.decode(self.auth?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// "https://index.docker.io/v1/" and "docker.io" name the same registry.
fn registry_key(raw: &str) -> String {
    let host = raw
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    normalize_registry(host)
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    if scheme.is_empty() {
        return None;
    }

    let mut params = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quoted = false;
    for c in rest.chars() {
        match c {
            '"' if in_value => quoted = !quoted,
            '=' if !in_value => in_value = true,
            ',' if !quoted => {
                if !key.trim().is_empty() {
                    params.insert(key.trim().to_ascii_lowercase(), value.clone());
                }
                key.clear();
                value.clear();
                in_value = false;
            }
            c if in_value => value.push(c),
            c => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

enum Authorization {
    Anonymous,
    Bearer(String),
    Basic(BasicAuth),
}

/// Registry client resolving digests over HTTPS.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    fn base_url(registry: &str) -> String {
        if registry == "docker.io" {
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{}", registry)
        }
    }

    async fn head_manifest(&self, url: &str, auth: &Authorization) -> Result<reqwest::Response> {
        let request = self.http.head(url).header(ACCEPT, MANIFEST_ACCEPT);
        let request = match auth {
            Authorization::Anonymous => request,
            Authorization::Bearer(token) => request.bearer_auth(token),
            Authorization::Basic(basic) => {
                request.basic_auth(&basic.username, Some(&basic.password))
            }
        };
        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        challenge: &Challenge,
        image: &ImageReference,
        credentials: Option<&BasicAuth>,
    ) -> Result<String> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| Error::Registry("bearer challenge without realm".to_string()))?;
        let default_scope = format!("repository:{}:pull", image.repository);
        let scope = challenge.params.get("scope").unwrap_or(&default_scope);

        let mut request = self.http.get(realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = challenge.params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some(basic) = credentials {
            request = request.basic_auth(&basic.username, Some(&basic.password));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "token endpoint {} returned {}",
                realm,
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::Registry("token response without token".to_string()))
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(&image.registry),
            image.repository,
            image.reference()
        );
        let basic = credentials.for_registry(&image.registry);

        let mut response = self.head_manifest(&url, &Authorization::Anonymous).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_challenge)
                .ok_or_else(|| Error::Registry(format!("{} requires auth without challenge", url)))?;
            let auth = match challenge.scheme.as_str() {
                "bearer" => {
                    Authorization::Bearer(self.fetch_token(&challenge, image, basic).await?)
                }
                "basic" => Authorization::Basic(basic.cloned().ok_or_else(|| {
                    Error::Registry(format!("no credentials for {}", image.registry))
                })?),
                other => {
                    return Err(Error::Registry(format!("unsupported auth scheme '{}'", other)));
                }
            };
            response = self.head_manifest(&url, &auth).await?;
        }

        if !response.status().is_success() {
            return Err(Error::Registry(format!("{} returned {}", url, response.status())));
        }
        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Registry(format!("{} returned no digest", url)))?;
        debug!(image = %image, digest, "Resolved image digest");
        Ok(digest.to_string())
    }
}
