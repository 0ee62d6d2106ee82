//! Routes admission reviews to the mutator registered for `(kind, group)`.
//!
//! The dispatcher owns the request budget and the task flush: work a mutator
//! defers only reaches the scheduler once a response has been built, so a
//! failed or timed-out request leaves nothing behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use super::Decision;
use crate::error::AdmissionError;
use crate::health::HealthState;
use crate::mutators::{
    AppClusterMutator, ConfigMapMutator, IngressMutator, LonghornNodeMutator,
    LonghornReplicaMutator, McpBridgeMutator, MutationContext, Mutator, NodeMutator, PodMutator,
    SecretMutator, ServiceAccountMutator, ServiceMutator, Services, StorageClassMutator,
    TenantClusterMutator, VirtualClusterPolicyMutator, WorkloadMutator,
};
use crate::resources::custom::{HIGRESS_GROUP, K3K_GROUP, KUBEBLOCKS_GROUP, LONGHORN_GROUP};
use crate::resources::workload::WorkloadKind;
use crate::scheduler::{ScheduledTask, Scheduler};

/// Routing key: resource kind and API group ("" for core).
pub type RouteKey = (String, String);

pub struct Dispatcher {
    routes: HashMap<RouteKey, Arc<dyn Mutator>>,
    services: Services,
    scheduler: Arc<dyn Scheduler>,
    health_state: Option<Arc<HealthState>>,
    timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher with an empty routing table
    pub fn new(services: Services, scheduler: Arc<dyn Scheduler>) -> Self {
        let timeout = services.settings.admission_timeout;
        Self {
            routes: HashMap::new(),
            services,
            scheduler,
            health_state: None,
            timeout,
        }
    }

    /// Dispatcher routing every kind this engine knows how to handle.
    ///
    /// Which of them actually arrive is decided by the registered rule sets.
    pub fn with_default_routes(services: Services, scheduler: Arc<dyn Scheduler>) -> Self {
        let mut dispatcher = Self::new(services, scheduler);
        dispatcher.register("Pod", "", PodMutator);
        for kind in [
            WorkloadKind::Deployment,
            WorkloadKind::StatefulSet,
            WorkloadKind::DaemonSet,
        ] {
            dispatcher.register(kind.as_str(), "apps", WorkloadMutator::new(kind));
        }
        dispatcher.register("Ingress", "networking.k8s.io", IngressMutator);
        dispatcher.register("ServiceAccount", "", ServiceAccountMutator);
        dispatcher.register("Node", "", NodeMutator);
        dispatcher.register("Node", LONGHORN_GROUP, LonghornNodeMutator);
        dispatcher.register("Replica", LONGHORN_GROUP, LonghornReplicaMutator);
        dispatcher.register("StorageClass", "storage.k8s.io", StorageClassMutator);
        dispatcher.register("VirtualClusterPolicy", K3K_GROUP, VirtualClusterPolicyMutator);
        dispatcher.register("Cluster", K3K_GROUP, TenantClusterMutator);
        dispatcher.register("Cluster", KUBEBLOCKS_GROUP, AppClusterMutator);
        dispatcher.register("Service", "", ServiceMutator);
        dispatcher.register("Secret", "", SecretMutator);
        dispatcher.register("ConfigMap", "", ConfigMapMutator);
        dispatcher.register("McpBridge", HIGRESS_GROUP, McpBridgeMutator);
        dispatcher
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<M: Mutator + 'static>(&mut self, kind: &str, group: &str, mutator: M) {
        self.routes
            .insert((kind.to_string(), group.to_string()), Arc::new(mutator));
    }

    pub fn route(&self, kind: &str, group: &str) -> Option<&Arc<dyn Mutator>> {
        self.routes.get(&(kind.to_string(), group.to_string()))
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }

    /// Decide a request and return the deferred work it produced.
    ///
    /// Nothing is scheduled here; the caller flushes the tasks once it holds
    /// a response.
    pub async fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<(Decision, Vec<ScheduledTask>), AdmissionError> {
        let Some(mutator) = self.route(&request.kind.kind, &request.kind.group) else {
            debug!(kind = %request.kind.kind, group = %request.kind.group, "No mutator registered");
            return Ok((Decision::allowed("kind is not handled"), Vec::new()));
        };
        let ctx = MutationContext::new(&self.services);
        let decision = tokio::time::timeout(self.timeout, mutator.decide(request, &ctx))
            .await
            .map_err(|_| AdmissionError::Timeout(self.timeout.as_millis()))??;
        Ok((decision, ctx.take_tasks()))
    }

    /// Handle one review end to end.
    pub async fn review(
        &self,
        review: AdmissionReview<DynamicObject>,
    ) -> (StatusCode, AdmissionReview<DynamicObject>) {
        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to extract admission request");
                return invalid(AdmissionError::Protocol(e.to_string()));
            }
        };

        let started = Instant::now();
        let operation = operation_label(&request.operation);
        info!(
            uid = %request.uid,
            kind = %request.kind.kind,
            group = %request.kind.group,
            namespace = request.namespace.as_deref().unwrap_or_default(),
            name = %request.name,
            operation,
            user = request.user_info.username.as_deref().unwrap_or_default(),
            "Processing admission request"
        );

        let outcome = self.decide(&request).await.and_then(|(decision, tasks)| {
            let label = decision.label();
            match &decision {
                Decision::Denied(reason) => {
                    warn!(uid = %request.uid, reason = %reason, "Admission request denied")
                }
                Decision::Allowed(reason) | Decision::Patched { reason, .. } => {
                    debug!(uid = %request.uid, decision = label, reason = %reason, "Admission decided")
                }
            }
            let review = decision.into_review(&request)?;
            Ok((label, review, tasks))
        });

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok((label, review, tasks)) => {
                for task in tasks {
                    self.scheduler.schedule(task);
                }
                self.record(&request.kind.kind, operation, label, elapsed);
                (StatusCode::OK, review)
            }
            Err(e) => {
                error!(uid = %request.uid, kind = %request.kind.kind, error = %e, "Admission request failed");
                self.record(&request.kind.kind, operation, e.label(), elapsed);
                invalid(e)
            }
        }
    }

    fn record(&self, kind: &str, operation: &str, decision: &str, elapsed: f64) {
        if let Some(state) = &self.health_state {
            state
                .metrics
                .record_admission(kind, operation, decision, elapsed);
        }
    }
}

fn invalid(e: AdmissionError) -> (StatusCode, AdmissionReview<DynamicObject>) {
    (
        e.status_code(),
        AdmissionResponse::invalid(e.to_string()).into_review(),
    )
}

pub fn operation_label(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}
