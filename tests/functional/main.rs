// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the admission plane.
//!
//! These tests drive admission reviews through the dispatcher and every
//! mutator WITHOUT requiring a live Kubernetes cluster. The API server,
//! the platform hooks and the image registry are replaced by in-memory
//! fakes, and deferred tasks land on a manual scheduler so each test can
//! run them explicitly.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_pause_scales_down_and_evicts
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Dispatcher tests**: routing, fail-open errors, timeouts, the HTTP surface
//! - **Pod and workload tests**: resource governance and its convergence
//! - **Tenant lifecycle tests**: restart and pause of virtual control planes
//! - **Ingress and platform tests**: side effects queued for the platform
//! - **Bootstrap tests**: serving certificate and webhook registration

mod fixtures;

mod bootstrap_tests;
mod pod_tests;
