//! tenant-admission library crate
//!
//! A mutating admission webhook for a multi-tenant platform. Requests are
//! routed by `(kind, group)` to per-kind mutators that inject resource
//! governance, pin images and queue platform side effects. The crate also
//! owns the serving certificate and the webhook registrations.

pub mod cluster;
pub mod config;
pub mod error;
pub mod governance;
pub mod health;
pub mod hooks;
pub mod imaging;
pub mod mutators;
pub mod quantity;
pub mod resources;
pub mod scheduler;
pub mod tenant;
pub mod webhooks;

pub use config::Settings;
pub use error::{AdmissionError, Error, Result};
pub use health::HealthState;
pub use webhooks::{Decision, Dispatcher, WebhookError, run_webhook_server};
