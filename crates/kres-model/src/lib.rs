//! Shared Kubernetes resource model for kres.
//!
//! Everything in this crate is pure: identifiers, decoded manifests, change
//! classification and readiness predicates operate on in-memory snapshots
//! and never talk to a cluster.

pub mod diff;
pub mod id;
pub mod immutable;
pub mod manifest;
pub mod readiness;

pub use diff::{
	classify, ChangeKind, Classification, FieldChange, FieldOp, FieldPath, Observed, RecreateReason,
};
pub use id::{IdError, ResourceId};
pub use manifest::{Manifest, ManifestError};
pub use readiness::{Readiness, WaitMachine, WaitState};

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}
