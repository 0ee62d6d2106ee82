//! Admission webhook plumbing: decisions, routing, registration, serving
//! certificates and the HTTPS server.

pub mod certs;
mod decision;
pub mod dispatcher;
pub mod registration;
mod server;

pub use certs::{CertificateManager, CertificateMaterial};
pub use decision::Decision;
pub use dispatcher::Dispatcher;
pub use registration::{MUTATE_PATH, WebhookRegistrar};
pub use server::{WebhookError, create_webhook_router, run_webhook_server};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
