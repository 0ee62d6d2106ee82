//! Mutating webhook configuration upsert.
//!
//! Two configurations are kept in sync with the running deployment: one for
//! built-in kinds and one for custom resources, each pointing at this
//! service's `/mutate` endpoint with the serving CA embedded.

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use tracing::info;

use crate::cluster::ClusterApi;
use crate::config::{DeploymentMode, Settings};
use crate::error::Result;

pub const MUTATE_PATH: &str = "/mutate";
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

const CREATE: &str = "CREATE";
const UPDATE: &str = "UPDATE";
const DELETE: &str = "DELETE";

/// One admission rule: which resources and operations reach the webhook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub group: &'static str,
    pub version: &'static str,
    pub resources: &'static [&'static str],
    pub operations: &'static [&'static str],
}

const fn rule(
    group: &'static str,
    version: &'static str,
    resources: &'static [&'static str],
    operations: &'static [&'static str],
) -> RuleSpec {
    RuleSpec {
        group,
        version,
        resources,
        operations,
    }
}

const ROOT_CORE_RULES: &[RuleSpec] = &[
    rule("", "v1", &["services"], &[CREATE, UPDATE]),
    rule("", "v1", &["serviceaccounts"], &[UPDATE]),
    rule(
        "apps",
        "v1",
        &["statefulsets", "deployments", "daemonsets"],
        &[CREATE, UPDATE],
    ),
    rule("networking.k8s.io", "v1", &["ingresses"], &[CREATE, UPDATE, DELETE]),
    rule("", "v1", &["pods", "pods/status"], &[CREATE, UPDATE]),
    rule("", "v1", &["secrets"], &[CREATE, UPDATE, DELETE]),
    rule("", "v1", &["nodes"], &[CREATE, UPDATE, DELETE]),
    rule("storage.k8s.io", "v1", &["storageclasses"], &[CREATE, UPDATE]),
];

const ROOT_CRD_RULES: &[RuleSpec] = &[
    rule(
        "k3k.io",
        "v1alpha1",
        &["virtualclusterpolicies", "clusters"],
        &[CREATE, UPDATE],
    ),
    rule("networking.higress.io", "v1", &["mcpbridges"], &[CREATE, UPDATE, DELETE]),
    rule("longhorn.io", "v1beta2", &["replicas"], &[CREATE, UPDATE, DELETE]),
    rule("longhorn.io", "v1beta2", &["nodes"], &[CREATE, UPDATE]),
    rule("apps.kubeblocks.io", "v1alpha1", &["clusters"], &[DELETE]),
];

const AGENT_CORE_RULES: &[RuleSpec] = &[
    rule("networking.k8s.io", "v1", &["ingresses"], &[CREATE, UPDATE, DELETE]),
    rule("", "v1", &["configmaps"], &[CREATE, UPDATE]),
    rule("", "v1", &["secrets"], &[CREATE, UPDATE, DELETE]),
];

const AGENT_CRD_RULES: &[RuleSpec] = &[
    rule("networking.higress.io", "v1", &["mcpbridges"], &[CREATE, UPDATE, DELETE]),
    rule("apps.kubeblocks.io", "v1alpha1", &["clusters"], &[DELETE]),
];

/// Rule sets for (core, custom resources) in the given mode.
pub fn rule_sets(mode: DeploymentMode) -> (&'static [RuleSpec], &'static [RuleSpec]) {
    match mode {
        DeploymentMode::Root => (ROOT_CORE_RULES, ROOT_CRD_RULES),
        DeploymentMode::Agent => (AGENT_CORE_RULES, AGENT_CRD_RULES),
    }
}

fn to_rule(spec: &RuleSpec) -> RuleWithOperations {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    RuleWithOperations {
        api_groups: Some(vec![spec.group.to_string()]),
        api_versions: Some(vec![spec.version.to_string()]),
        resources: Some(owned(spec.resources)),
        operations: Some(owned(spec.operations)),
        scope: None,
    }
}

fn configuration(
    name: String,
    rules: &[RuleSpec],
    settings: &Settings,
    ca_bundle: &[u8],
) -> MutatingWebhookConfiguration {
    let webhook = MutatingWebhook {
        name: settings.service_host(),
        admission_review_versions: vec!["v1".to_string()],
        client_config: WebhookClientConfig {
            ca_bundle: Some(ByteString(ca_bundle.to_vec())),
            service: Some(ServiceReference {
                name: settings.service_name.clone(),
                namespace: settings.namespace.clone(),
                path: Some(MUTATE_PATH.to_string()),
                port: Some(i32::from(settings.port)),
            }),
            url: None,
        },
        rules: Some(rules.iter().map(to_rule).collect()),
        namespace_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "Exists".to_string(),
                values: None,
            }]),
            match_labels: None,
        }),
        side_effects: "NoneOnDryRun".to_string(),
        failure_policy: Some("Ignore".to_string()),
        ..Default::default()
    };
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        webhooks: Some(vec![webhook]),
    }
}

/// Both configurations for this deployment, embedding `ca_bundle`.
pub fn desired_configurations(
    settings: &Settings,
    ca_bundle: &[u8],
) -> Vec<MutatingWebhookConfiguration> {
    let (core, crd) = rule_sets(settings.mode);
    vec![
        configuration(settings.core_webhook_name(), core, settings, ca_bundle),
        configuration(settings.crd_webhook_name(), crd, settings, ca_bundle),
    ]
}

/// Creates or replaces the webhook configurations.
pub struct WebhookRegistrar<'a> {
    cluster: &'a dyn ClusterApi,
    settings: &'a Settings,
}

impl<'a> WebhookRegistrar<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, settings: &'a Settings) -> Self {
        Self { cluster, settings }
    }

    pub async fn register(&self, ca_bundle: &[u8]) -> Result<()> {
        for desired in desired_configurations(self.settings, ca_bundle) {
            self.upsert(desired).await?;
        }
        Ok(())
    }

    async fn upsert(&self, desired: MutatingWebhookConfiguration) -> Result<()> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        match self.cluster.get_webhook_configuration(&name).await? {
            None => match self.cluster.create_webhook_configuration(&desired).await {
                Ok(()) => {
                    info!(name = %name, "Created mutating webhook configuration");
                    Ok(())
                }
                // another replica created it first
                Err(e) if e.is_already_exists() => self.replace_latest(&name, desired).await,
                Err(e) => Err(e),
            },
            Some(existing) => self.replace(existing, desired).await,
        }
    }

    async fn replace(
        &self,
        existing: MutatingWebhookConfiguration,
        mut desired: MutatingWebhookConfiguration,
    ) -> Result<()> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        desired.metadata.resource_version = existing.metadata.resource_version;
        match self.cluster.replace_webhook_configuration(&desired).await {
            Ok(()) => {
                info!(name = %name, "Updated mutating webhook configuration");
                Ok(())
            }
            Err(e) if e.is_conflict() => self.replace_latest(&name, desired).await,
            Err(e) => Err(e),
        }
    }

    /// Re-read and replace once with the current resource version.
    async fn replace_latest(
        &self,
        name: &str,
        mut desired: MutatingWebhookConfiguration,
    ) -> Result<()> {
        let latest = self.cluster.get_webhook_configuration(name).await?;
        desired.metadata.resource_version = latest.and_then(|c| c.metadata.resource_version);
        self.cluster.replace_webhook_configuration(&desired).await?;
        info!(name, "Updated mutating webhook configuration after conflict");
        Ok(())
    }
}
