//! Runtime settings read from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;
/// Default directory the TLS material is mirrored into
pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";
/// Certificate file name inside the cert dir and key inside the secret
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Private key file name inside the cert dir and key inside the secret
pub const TLS_KEY_FILE: &str = "tls.key";

const DEFAULT_SERVICE_NAME: &str = "w7panel";
const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 8;
const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Which cluster this process runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Management cluster hosting every tenant
    Root,
    /// Agent inside a single tenant cluster
    Agent,
}

/// Settings shared by every component.
#[derive(Clone, Debug)]
pub struct Settings {
    pub service_name: String,
    pub namespace: String,
    pub mode: DeploymentMode,
    /// This process runs inside a tenant's virtual control plane
    pub virtual_tenant: bool,
    pub tenant_account_namespace: String,
    pub load_balancer_class: Option<String>,
    pub lxcfs_enabled: bool,
    pub hook_endpoint: Option<String>,
    pub cert_dir: PathBuf,
    pub port: u16,
    pub admission_timeout: Duration,
    pub renew_before_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            namespace: "default".to_string(),
            mode: DeploymentMode::Root,
            virtual_tenant: false,
            tenant_account_namespace: "default".to_string(),
            load_balancer_class: None,
            lxcfs_enabled: false,
            hook_endpoint: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            port: WEBHOOK_PORT,
            admission_timeout: Duration::from_secs(DEFAULT_ADMISSION_TIMEOUT_SECS),
            renew_before_days: DEFAULT_RENEW_BEFORE_DAYS,
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let service_name = get("SVC_NAME").unwrap_or_else(|| {
            warn!("SVC_NAME not set, using '{}'", DEFAULT_SERVICE_NAME);
            defaults.service_name.clone()
        });
        let namespace = get("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.namespace.clone()
        });
        let mode = if is_true(get("IS_CHILD")) {
            DeploymentMode::Agent
        } else {
            DeploymentMode::Root
        };

        let port = match get("WEBHOOK_PORT") {
            Some(v) => v
                .parse()
                .map_err(|e| Error::Config(format!("WEBHOOK_PORT '{}': {}", v, e)))?,
            None => defaults.port,
        };
        let admission_timeout = match get("ADMISSION_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .map_err(|e| Error::Config(format!("ADMISSION_TIMEOUT_SECS '{}': {}", v, e)))?,
            ),
            None => defaults.admission_timeout,
        };
        let renew_before_days = match get("CERT_RENEW_BEFORE_DAYS") {
            Some(v) => v
                .parse()
                .map_err(|e| Error::Config(format!("CERT_RENEW_BEFORE_DAYS '{}': {}", v, e)))?,
            None => defaults.renew_before_days,
        };

        Ok(Self {
            service_name,
            namespace,
            mode,
            virtual_tenant: get("K3K_MODE").is_some_and(|v| v == "virtual"),
            tenant_account_namespace: get("TENANT_ACCOUNT_NAMESPACE")
                .unwrap_or(defaults.tenant_account_namespace),
            load_balancer_class: get("SVC_LB_CLASS"),
            lxcfs_enabled: is_true(get("LXCFS_ENABLED")),
            hook_endpoint: get("PLATFORM_HOOK_URL").map(|u| u.trim_end_matches('/').to_string()),
            cert_dir: get("WEBHOOK_CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cert_dir),
            port,
            admission_timeout,
            renew_before_days,
        })
    }

    /// In-cluster DNS name of the webhook service
    pub fn service_host(&self) -> String {
        format!("{}.{}.svc", self.service_name, self.namespace)
    }

    /// Secret holding the serving certificate
    pub fn secret_name(&self) -> String {
        format!("{}-webhook-tls", self.service_name)
    }

    /// Webhook configuration for built-in kinds
    pub fn core_webhook_name(&self) -> String {
        format!("{}-webhook", self.service_name)
    }

    /// Webhook configuration for custom resources
    pub fn crd_webhook_name(&self) -> String {
        format!("{}-crd-webhook", self.service_name)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_KEY_FILE)
    }

    pub fn is_root(&self) -> bool {
        self.mode == DeploymentMode::Root
    }
}

fn is_true(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
