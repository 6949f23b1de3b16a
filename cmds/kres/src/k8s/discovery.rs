//! Kubernetes API resource discovery and caching.
//!
//! This module handles discovering API resources from the cluster's
//! discovery API, caching the results for lookups by apiVersion and kind,
//! and mapping a version-independent [`ResourceId`] to the group's preferred
//! version.

use std::collections::HashMap;

use kres_model::{Manifest, ResourceId};
use kube::{
	core::GroupVersionKind,
	discovery::{ApiCapabilities, ApiResource, Scope},
	Client, Discovery,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

use super::ResourceScope;

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),

	#[error("no matches for kind \"{kind}\" in version \"{api_version}\"")]
	UnknownResourceType { api_version: String, kind: String },

	#[error("no matches for kind \"{kind}\" in group \"{group}\"")]
	UnknownKind { group: String, kind: String },
}

/// Extract a GroupVersionKind from a manifest.
pub fn gvk_from_manifest(manifest: &Manifest) -> GroupVersionKind {
	GroupVersionKind::gvk(manifest.group(), manifest.version(), manifest.kind())
}

/// Create a GroupVersionKind from a kube ApiResource.
fn gvk_from_api_resource(ar: &ApiResource) -> GroupVersionKind {
	GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
}

fn scope_of(caps: &ApiCapabilities) -> ResourceScope {
	match caps.scope {
		Scope::Namespaced => ResourceScope::Namespaced,
		Scope::Cluster => ResourceScope::ClusterWide,
	}
}

/// Discovered API resource with scope and capabilities.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
	/// The kube ApiResource for making API calls.
	pub api_resource: ApiResource,
	/// Whether this resource is namespaced or cluster-wide.
	pub scope: ResourceScope,
	/// API capabilities (verbs, subresources, etc.)
	pub capabilities: ApiCapabilities,
}

/// Cached API resource discovery results.
#[derive(Clone, Default)]
pub struct ApiResourceCache {
	resources: HashMap<GroupVersionKind, DiscoveredResource>,
	/// (group, kind) to the group's preferred version of that kind.
	preferred: HashMap<(String, String), GroupVersionKind>,
}

impl ApiResourceCache {
	/// Build the cache by querying the cluster's discovery API.
	///
	/// Uses the Aggregated Discovery API (K8s 1.26+) which requires only 2 API calls,
	/// and falls back to full discovery for older clusters.
	#[instrument(skip_all)]
	pub async fn build(client: &Client) -> Result<Self, DiscoveryError> {
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				Ok(Self::from_discovery(&discovery))
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
				let discovery = Discovery::new(client.clone())
					.run()
					.await
					.map_err(DiscoveryError::FullDiscovery)?;
				Ok(Self::from_discovery(&discovery))
			}
		}
	}

	/// Build cache from a completed Discovery.
	fn from_discovery(discovery: &Discovery) -> Self {
		let mut cache = Self::default();

		for group in discovery.groups() {
			// Every version, so manifests pinned to an older apiVersion still resolve
			for ver in group.versions() {
				for (ar, caps) in group.versioned_resources(ver) {
					cache.insert(ar, caps);
				}
			}
			for (ar, _) in group.recommended_resources() {
				cache
					.preferred
					.insert((ar.group.clone(), ar.kind.clone()), gvk_from_api_resource(&ar));
			}
		}

		cache
	}

	fn insert(&mut self, api_resource: ApiResource, capabilities: ApiCapabilities) {
		let gvk = gvk_from_api_resource(&api_resource);
		let scope = scope_of(&capabilities);
		self.resources.insert(
			gvk,
			DiscoveredResource {
				api_resource,
				scope,
				capabilities,
			},
		);
	}

	/// Look up a resource by its GroupVersionKind.
	pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&DiscoveredResource> {
		self.resources.get(gvk)
	}

	/// Look up the preferred version of a kind within a group.
	pub fn preferred(&self, group: &str, kind: &str) -> Option<&DiscoveredResource> {
		let gvk = self.preferred.get(&(group.to_string(), kind.to_string()))?;
		self.resources.get(gvk)
	}

	/// Number of cached resource versions.
	pub fn len(&self) -> usize {
		self.resources.len()
	}

	pub fn is_empty(&self) -> bool {
		self.resources.is_empty()
	}
}

/// Shared REST mapper: resolves manifests and IDs to API resources.
///
/// Misses trigger one rediscovery, so kinds registered by a
/// CustomResourceDefinition applied earlier in the same run resolve.
pub struct RestMapper {
	client: Client,
	cache: RwLock<ApiResourceCache>,
}

impl RestMapper {
	/// Discover the cluster's API resources.
	pub async fn new(client: Client) -> Result<Self, DiscoveryError> {
		let cache = ApiResourceCache::build(&client).await?;
		tracing::debug!(resources = cache.len(), "discovered API resources");
		Ok(Self {
			client,
			cache: RwLock::new(cache),
		})
	}

	/// Re-run discovery, replacing the cached results.
	pub async fn refresh(&self) -> Result<(), DiscoveryError> {
		let cache = ApiResourceCache::build(&self.client).await?;
		*self.cache.write().await = cache;
		Ok(())
	}

	async fn lookup_with_refresh<F>(&self, find: F) -> Result<Option<DiscoveredResource>, DiscoveryError>
	where
		F: Fn(&ApiResourceCache) -> Option<&DiscoveredResource>,
	{
		if let Some(found) = find(&*self.cache.read().await) {
			return Ok(Some(found.clone()));
		}
		self.refresh().await?;
		Ok(find(&*self.cache.read().await).cloned())
	}

	/// Resolve the API resource for a manifest's apiVersion and kind.
	#[instrument(skip_all, fields(id = %manifest.id()))]
	pub async fn resolve(&self, manifest: &Manifest) -> Result<DiscoveredResource, DiscoveryError> {
		let gvk = gvk_from_manifest(manifest);
		self.lookup_with_refresh(|cache| cache.lookup(&gvk))
			.await?
			.ok_or_else(|| DiscoveryError::UnknownResourceType {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
			})
	}

	/// Resolve the preferred API version for an ID's group and kind.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn resolve_id(&self, id: &ResourceId) -> Result<DiscoveredResource, DiscoveryError> {
		self.lookup_with_refresh(|cache| cache.preferred(id.group(), id.kind()))
			.await?
			.ok_or_else(|| DiscoveryError::UnknownKind {
				group: id.group().to_string(),
				kind: id.kind().to_string(),
			})
	}
}
