//! Serving certificate lifecycle.
//!
//! The certificate lives in a Secret so every replica serves the same one.
//! It is generated when missing, regenerated when unreadable or close to
//! expiry, and mirrored into the directory the TLS listener loads from.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SanType,
    SerialNumber,
};
use tracing::{info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::cluster::ClusterApi;
use crate::config::{Settings, TLS_CERT_FILE, TLS_KEY_FILE};
use crate::error::{Error, Result};

/// Validity of generated certificates
pub const CERT_VALIDITY_DAYS: i64 = 365;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// PEM certificate and key with the certificate's expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    /// Unix timestamp of `notAfter`
    pub not_after: i64,
}

impl CertificateMaterial {
    /// Self-signed RSA-2048 serving certificate for `host`.
    pub fn generate(host: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            Ia5String::try_from(host.to_string())
                .map_err(|e| Error::Certificate(format!("invalid DNS name {}: {}", host, e)))?,
        )];
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ::time::Duration::days(CERT_VALIDITY_DAYS);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from_slice(&rand::random::<[u8; 16]>()));

        let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
            .map_err(|e| Error::Certificate(format!("generate key: {}", e)))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Certificate(format!("sign certificate: {}", e)))?;
        let cert_pem = cert.pem();
        let not_after = certificate_expiry(&cert_pem)?;
        Ok(Self {
            cert_pem,
            key_pem: key.serialize_pem(),
            not_after,
        })
    }

    /// Read material back from the stored secret.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| Error::Certificate("secret has no data".to_string()))?;
        let field = |key: &str| -> Result<String> {
            let bytes = data
                .get(key)
                .ok_or_else(|| Error::Certificate(format!("secret has no {}", key)))?;
            String::from_utf8(bytes.0.clone())
                .map_err(|e| Error::Certificate(format!("{} is not UTF-8: {}", key, e)))
        };
        let cert_pem = field(TLS_CERT_FILE)?;
        let key_pem = field(TLS_KEY_FILE)?;
        let not_after = certificate_expiry(&cert_pem)?;
        Ok(Self {
            cert_pem,
            key_pem,
            not_after,
        })
    }

    /// Whether the certificate expires within `days` of `now` (Unix seconds)
    pub fn expires_within(&self, days: i64, now: i64) -> bool {
        self.not_after - now <= days * SECONDS_PER_DAY
    }

    /// `kubernetes.io/tls` secret payload holding this material
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                TLS_CERT_FILE.to_string(),
                ByteString(self.cert_pem.clone().into_bytes()),
            ),
            (
                TLS_KEY_FILE.to_string(),
                ByteString(self.key_pem.clone().into_bytes()),
            ),
        ])
    }
}

/// `notAfter` of a PEM certificate as a Unix timestamp.
pub fn certificate_expiry(cert_pem: &str) -> Result<i64> {
    let pem = ::pem::parse(cert_pem)
        .map_err(|e| Error::Certificate(format!("parse PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| Error::Certificate(format!("parse certificate: {}", e)))?;
    Ok(cert.validity().not_after.timestamp())
}

/// Write `tls.crt` (0644) and `tls.key` (0600) into `dir` (0755).
pub fn write_material(dir: &Path, material: &CertificateMaterial) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;

    let cert_path = dir.join(TLS_CERT_FILE);
    fs::write(&cert_path, &material.cert_pem)?;
    fs::set_permissions(&cert_path, fs::Permissions::from_mode(0o644))?;

    let key_path = dir.join(TLS_KEY_FILE);
    fs::write(&key_path, &material.key_pem)?;
    fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Keeps the stored serving certificate valid and mirrored to disk.
pub struct CertificateManager<'a> {
    cluster: &'a dyn ClusterApi,
    settings: &'a Settings,
}

impl<'a> CertificateManager<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, settings: &'a Settings) -> Self {
        Self { cluster, settings }
    }

    /// Load, create or rotate the certificate, then mirror it to disk.
    pub async fn ensure(&self) -> Result<CertificateMaterial> {
        let material = self.load_or_issue().await?;
        write_material(&self.settings.cert_dir, &material)?;
        info!(
            dir = %self.settings.cert_dir.display(),
            not_after = material.not_after,
            "Serving certificate ready"
        );
        Ok(material)
    }

    async fn load_or_issue(&self) -> Result<CertificateMaterial> {
        let namespace = &self.settings.namespace;
        let name = self.settings.secret_name();
        let now = jiff::Timestamp::now().as_second();

        let Some(existing) = self.cluster.get_secret(namespace, &name).await? else {
            return self.create(now).await;
        };
        match CertificateMaterial::from_secret(&existing) {
            Ok(material) if !material.expires_within(self.settings.renew_before_days, now) => {
                Ok(material)
            }
            Ok(_) => {
                info!(secret = %name, "Serving certificate close to expiry, rotating");
                self.rotate(existing).await
            }
            Err(e) => {
                warn!(secret = %name, error = %e, "Stored certificate unreadable, regenerating");
                self.rotate(existing).await
            }
        }
    }

    async fn create(&self, now: i64) -> Result<CertificateMaterial> {
        let namespace = &self.settings.namespace;
        let name = self.settings.secret_name();
        let material = CertificateMaterial::generate(&self.settings.service_host())?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(material.secret_data()),
            ..Default::default()
        };
        match self.cluster.create_secret(namespace, &secret).await {
            Ok(_) => {
                info!(secret = %name, "Stored new serving certificate");
                Ok(material)
            }
            // another replica won the race; serve what it stored
            Err(e) if e.is_already_exists() => {
                let stored = self
                    .cluster
                    .get_secret(namespace, &name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("secret {}/{}", namespace, name)))?;
                let material = CertificateMaterial::from_secret(&stored)?;
                if material.expires_within(self.settings.renew_before_days, now) {
                    warn!(secret = %name, "Certificate stored by another replica is close to expiry");
                }
                Ok(material)
            }
            Err(e) => Err(e),
        }
    }

    async fn rotate(&self, mut existing: Secret) -> Result<CertificateMaterial> {
        let namespace = &self.settings.namespace;
        let material = CertificateMaterial::generate(&self.settings.service_host())?;
        existing.data = Some(material.secret_data());
        existing.string_data = None;
        match self.cluster.replace_secret(namespace, &existing).await {
            Ok(_) => Ok(material),
            Err(e) if e.is_conflict() => {
                // a concurrent rotation landed first
                let name = self.settings.secret_name();
                let stored = self
                    .cluster
                    .get_secret(namespace, &name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("secret {}/{}", namespace, name)))?;
                CertificateMaterial::from_secret(&stored)
            }
            Err(e) => Err(e),
        }
    }
}
