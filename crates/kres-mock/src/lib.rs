//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that can be used with kubeconfig-based connections.
//! It keeps objects in memory with resourceVersion and generation
//! bookkeeping, simulates workload rollouts and delayed deletion, rejects a
//! few invalid writes the way admission does, and records every resource
//! request for ordering assertions.

pub mod admission;
pub mod discovery;
mod helpers;
pub mod http;
pub mod state;

pub use admission::ImmutableField;
pub use discovery::{DiscoveryMode, MockApiGroup, MockApiResource, MockDiscovery, MockGroupVersion};
pub use http::{HttpMockK8sServer, RunningHttpMockK8sServer};
pub use state::{JournalEntry, RolloutMode};
