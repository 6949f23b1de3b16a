//! Create, read, update, delete and import for single resources.
//!
//! [`Lifecycle`] validates manifests against API discovery before any write,
//! classifies the change against the live object, and dispatches to the
//! [`Applier`] and the [`ReadinessEngine`].

use std::time::Duration;

use kres_model::{classify, ChangeKind, Classification, IdError, Manifest, ManifestError, Observed, ResourceId};
use thiserror::Error;
use tracing::instrument;

use crate::k8s::{
	apply::{Applier, ApplyError},
	discovery::{DiscoveredResource, DiscoveryError, RestMapper},
	wait::{ReadinessEngine, WaitError},
};

/// Timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-operation deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
	pub create: Duration,
	pub update: Duration,
	pub delete: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			create: DEFAULT_TIMEOUT,
			update: DEFAULT_TIMEOUT,
			delete: DEFAULT_TIMEOUT,
		}
	}
}

/// Whether to block on readiness after a write, and for how long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
	pub wait: bool,
	pub timeouts: Timeouts,
}

impl WaitOptions {
	pub fn enabled(timeouts: Timeouts) -> Self {
		Self {
			wait: true,
			timeouts,
		}
	}
}

/// Errors that can occur during lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
	#[error(transparent)]
	InvalidId(#[from] IdError),

	#[error(transparent)]
	Manifest(#[from] ManifestError),

	#[error(transparent)]
	Discovery(#[from] DiscoveryError),

	#[error(transparent)]
	Apply(#[from] ApplyError),

	#[error(transparent)]
	Wait(#[from] WaitError),

	#[error("{id}: not found")]
	NotFound { id: ResourceId },
}

/// Classification of a pending change together with the object it was
/// computed against.
#[derive(Debug, Clone)]
pub struct Plan {
	pub classification: Classification,
	/// Live object, `None` when absent or when its type is not served yet.
	pub live: Option<Manifest>,
}

/// Result of [`Lifecycle::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
	/// The operation that was carried out.
	pub kind: ChangeKind,
	/// The object as returned by the last write, or as read when nothing was written.
	pub live: Option<Manifest>,
}

/// What reading the previous object found.
struct Observation {
	/// API resource of the previous object, when its type is served.
	resource: Option<DiscoveredResource>,
	live: Option<Manifest>,
}

impl Observation {
	fn observed(&self) -> Observed<'_> {
		match (&self.resource, &self.live) {
			(None, _) => Observed::Unfetched,
			(Some(_), None) => Observed::Absent,
			(Some(_), Some(live)) => Observed::Live(live),
		}
	}
}

/// Drives single resources through their lifecycle.
pub struct Lifecycle {
	mapper: RestMapper,
	applier: Applier,
	readiness: ReadinessEngine,
}

impl Lifecycle {
	pub fn new(mapper: RestMapper, applier: Applier) -> Self {
		let readiness = ReadinessEngine::new(applier.clone());
		Self {
			mapper,
			applier,
			readiness,
		}
	}

	pub fn mapper(&self) -> &RestMapper {
		&self.mapper
	}

	/// Resolve the manifest's type and check its namespace against the scope.
	async fn validated(&self, manifest: &Manifest) -> Result<DiscoveredResource, LifecycleError> {
		let resource = self.mapper.resolve(manifest).await?;
		manifest.validate(resource.scope)?;
		Ok(resource)
	}

	/// Resolve by apiVersion, falling back to the group's preferred version.
	///
	/// `None` when the type is not served at all.
	async fn try_resolve(&self, manifest: &Manifest) -> Result<Option<DiscoveredResource>, LifecycleError> {
		match self.mapper.resolve(manifest).await {
			Ok(resource) => return Ok(Some(resource)),
			Err(DiscoveryError::UnknownResourceType { .. }) => {}
			Err(e) => return Err(e.into()),
		}
		match self.mapper.resolve_id(manifest.id()).await {
			Ok(resource) => Ok(Some(resource)),
			Err(DiscoveryError::UnknownKind { .. }) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn observe(&self, previous: &Manifest) -> Result<Observation, LifecycleError> {
		let Some(resource) = self.try_resolve(previous).await? else {
			tracing::debug!(id = %previous.id(), "type not served, live object unfetched");
			return Ok(Observation {
				resource: None,
				live: None,
			});
		};
		let live = self.applier.get(&resource, previous.id()).await?;
		Ok(Observation {
			resource: Some(resource),
			live,
		})
	}

	async fn wait_ready(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
		wait: &WaitOptions,
		timeout: Duration,
	) -> Result<(), LifecycleError> {
		if wait.wait {
			self.readiness.wait_ready(resource, id, timeout).await?;
		}
		Ok(())
	}

	/// Create the object, optionally waiting for readiness.
	#[instrument(skip_all, fields(id = %desired.id()))]
	pub async fn create(&self, desired: &Manifest, wait: &WaitOptions) -> Result<Manifest, LifecycleError> {
		let resource = self.validated(desired).await?;
		self.create_validated(&resource, desired, wait).await
	}

	async fn create_validated(
		&self,
		resource: &DiscoveredResource,
		desired: &Manifest,
		wait: &WaitOptions,
	) -> Result<Manifest, LifecycleError> {
		let live = self.applier.create(resource, desired).await?;
		self.wait_ready(resource, desired.id(), wait, wait.timeouts.create)
			.await?;
		Ok(live)
	}

	/// Read the live object by ID, `None` when it or its type does not exist.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn read(&self, id: &ResourceId) -> Result<Option<Manifest>, LifecycleError> {
		let resource = match self.mapper.resolve_id(id).await {
			Ok(resource) => resource,
			Err(DiscoveryError::UnknownKind { .. }) => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		Ok(self.applier.get(&resource, id).await?)
	}

	/// Classify the change from `last_applied` (or the live object) to
	/// `desired`. `desired == None` plans a deletion.
	#[instrument(skip_all)]
	pub async fn plan(
		&self,
		desired: Option<&Manifest>,
		last_applied: Option<&Manifest>,
	) -> Result<Plan, LifecycleError> {
		if let Some(desired) = desired {
			self.validated(desired).await?;
		}
		let Some(previous) = last_applied.or(desired) else {
			return Ok(Plan {
				classification: classify(Observed::Absent, None, None),
				live: None,
			});
		};

		let observation = self.observe(previous).await?;
		let classification = classify(observation.observed(), desired, last_applied);
		Ok(Plan {
			classification,
			live: observation.live,
		})
	}

	/// Converge the cluster to `desired`.
	///
	/// Creates, updates in place, recreates or does nothing depending on the
	/// classification against the live object.
	#[instrument(skip_all, fields(id = %desired.id()))]
	pub async fn apply(
		&self,
		desired: &Manifest,
		last_applied: Option<&Manifest>,
		wait: &WaitOptions,
	) -> Result<Applied, LifecycleError> {
		let resource = self.validated(desired).await?;
		let previous = last_applied.unwrap_or(desired);
		let observation = self.observe(previous).await?;
		let classification = classify(observation.observed(), Some(desired), last_applied);

		tracing::info!(
			change = %classification.kind,
			reason = classification.reason.as_ref().map(tracing::field::display),
			"planned"
		);

		match classification.kind {
			// Delete is only classified without a desired manifest
			ChangeKind::NoOp | ChangeKind::Delete => {
				self.wait_ready(&resource, desired.id(), wait, wait.timeouts.update)
					.await?;
				Ok(Applied {
					kind: ChangeKind::NoOp,
					live: observation.live,
				})
			}
			ChangeKind::Create => {
				let live = self.create_validated(&resource, desired, wait).await?;
				Ok(Applied {
					kind: ChangeKind::Create,
					live: Some(live),
				})
			}
			ChangeKind::UpdateInPlace => match self.applier.update(&resource, desired, last_applied).await {
				Ok(live) => {
					self.wait_ready(&resource, desired.id(), wait, wait.timeouts.update)
						.await?;
					Ok(Applied {
						kind: ChangeKind::UpdateInPlace,
						live: Some(live),
					})
				}
				Err(e) if e.is_immutable_rejection() => {
					tracing::warn!(error = %e, "update rejected as immutable, recreating");
					self.recreate(observation, previous.id(), &resource, desired, wait)
						.await
				}
				Err(e) => Err(e.into()),
			},
			ChangeKind::Recreate => {
				self.recreate(observation, previous.id(), &resource, desired, wait)
					.await
			}
		}
	}

	/// Update from `last_applied` to `desired`.
	pub async fn update(
		&self,
		desired: &Manifest,
		last_applied: &Manifest,
		wait: &WaitOptions,
	) -> Result<Applied, LifecycleError> {
		self.apply(desired, Some(last_applied), wait).await
	}

	/// Delete the previous object, wait until it is gone, then create.
	async fn recreate(
		&self,
		observation: Observation,
		previous_id: &ResourceId,
		resource: &DiscoveredResource,
		desired: &Manifest,
		wait: &WaitOptions,
	) -> Result<Applied, LifecycleError> {
		if let Some(previous_resource) = &observation.resource {
			self.applier
				.delete_and_wait(previous_resource, previous_id, wait.timeouts.delete)
				.await?;
		}
		let live = self.create_validated(resource, desired, wait).await?;
		Ok(Applied {
			kind: ChangeKind::Recreate,
			live: Some(live),
		})
	}

	/// Delete the object described by `last_applied`.
	///
	/// Succeeds when the object or its type is already gone. Returns whether
	/// a deletion was issued.
	#[instrument(skip_all, fields(id = %last_applied.id()))]
	pub async fn delete(&self, last_applied: &Manifest, wait: &WaitOptions) -> Result<bool, LifecycleError> {
		let Some(resource) = self.try_resolve(last_applied).await? else {
			tracing::debug!("type not served, nothing to delete");
			return Ok(false);
		};
		self.delete_resolved(&resource, last_applied.id(), wait).await
	}

	/// Delete by ID, resolving the group's preferred version.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn delete_id(&self, id: &ResourceId, wait: &WaitOptions) -> Result<bool, LifecycleError> {
		let resource = match self.mapper.resolve_id(id).await {
			Ok(resource) => resource,
			Err(DiscoveryError::UnknownKind { .. }) => return Ok(false),
			Err(e) => return Err(e.into()),
		};
		self.delete_resolved(&resource, id, wait).await
	}

	async fn delete_resolved(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
		wait: &WaitOptions,
	) -> Result<bool, LifecycleError> {
		let deleted = self.applier.delete(resource, id).await?;
		if deleted && wait.wait {
			self.applier
				.wait_deleted(resource, id, wait.timeouts.delete)
				.await?;
		}
		Ok(deleted)
	}

	/// Rebuild last-applied state for an existing object.
	///
	/// Uses the last-applied annotation when present, otherwise the live
	/// object without server-populated fields.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn import(&self, id: &str) -> Result<Manifest, LifecycleError> {
		let id = ResourceId::decode(id)?;
		let resource = self.mapper.resolve_id(&id).await?;
		let live = self
			.applier
			.get(&resource, &id)
			.await?
			.ok_or_else(|| LifecycleError::NotFound { id: id.clone() })?;

		Ok(match live.last_applied() {
			Some(last_applied) => last_applied,
			None => {
				tracing::debug!("no last-applied annotation, using live object");
				live.stripped()
			}
		})
	}
}
