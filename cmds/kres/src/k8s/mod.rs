//! Kubernetes client module for apply, delete and readiness operations.
//!
//! This module provides native Kubernetes API access using kube-rs,
//! avoiding the need to shell out to kubectl.

pub mod apply;
pub mod client;
pub mod discovery;
pub mod retry;
pub mod wait;

pub use kres_model::ResourceScope;
