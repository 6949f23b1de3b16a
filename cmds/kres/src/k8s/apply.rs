//! Kubernetes resource apply engine.
//!
//! This module executes create, update and delete against the cluster for a
//! single resource. Updates either send a three-way JSON merge patch guarded
//! by a `resourceVersion` precondition, or use server-side apply. Conflicting
//! writes are retried with exponential backoff after re-reading the live
//! object.

use std::time::Duration;

use bon::Builder;
use clap::ValueEnum;
use kres_model::{diff::merge_patch, Manifest, ManifestError, ResourceId};
use kube::{
	api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
	Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	discovery::DiscoveredResource,
	retry::{retry_with_backoff, RetryConfig, RetryError},
	wait::{Tick, Ticker},
};

/// Field manager recorded on every write.
pub const DEFAULT_FIELD_MANAGER: &str = "kres";

/// Interval between reads while waiting for a deleted object to disappear.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How updates are sent to the API server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStrategy {
	/// Three-way JSON merge patch with a resourceVersion precondition.
	#[default]
	Merge,
	/// Server-side apply, forcing ownership of conflicting fields.
	Server,
}

/// Errors that can occur during apply operations.
#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("{id}: {message}")]
	AdmissionRejected {
		id: ResourceId,
		message: String,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("{id}: still conflicting after {attempts} attempts")]
	ConflictExhausted {
		id: ResourceId,
		attempts: u32,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("{id}: already exists")]
	AlreadyExists {
		id: ResourceId,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("{id}: not found")]
	NotFound { id: ResourceId },

	#[error("{verb} {id}")]
	Request {
		verb: &'static str,
		id: ResourceId,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("{id}: cancelled")]
	Cancelled { id: ResourceId },

	#[error("timed out deleting {id}")]
	DeleteTimeout { id: ResourceId },

	#[error("decoding {id} returned by the API server")]
	Decode {
		id: ResourceId,
		#[source]
		source: ManifestError,
	},

	#[error("converting manifest to DynamicObject")]
	ManifestConversion(#[source] serde_json::Error),
}

impl ApplyError {
	/// The API server rejected the write because it changes an immutable field.
	pub fn is_immutable_rejection(&self) -> bool {
		matches!(self, Self::AdmissionRejected { message, .. } if message.contains("field is immutable"))
	}

	fn failure(&self) -> Option<Failure> {
		match self {
			Self::Request { source, .. } => Some(Failure::of_error(source)),
			_ => None,
		}
	}

	fn is_conflict(&self) -> bool {
		self.failure() == Some(Failure::Conflict)
	}

	pub(crate) fn is_transient(&self) -> bool {
		self.failure() == Some(Failure::Transient)
	}
}

/// Coarse class of a failed API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
	Admission,
	AlreadyExists,
	Conflict,
	NotFound,
	Transient,
	Other,
}

impl Failure {
	fn of(code: u16, reason: &str, message: &str) -> Self {
		match code {
			400 | 422 => Self::Admission,
			403 if message.contains("admission webhook") => Self::Admission,
			404 => Self::NotFound,
			409 if reason == "AlreadyExists" => Self::AlreadyExists,
			409 => Self::Conflict,
			429 | 500 | 502 | 503 | 504 => Self::Transient,
			_ => Self::Other,
		}
	}

	fn of_error(error: &kube::Error) -> Self {
		match error {
			kube::Error::Api(status) => Self::of(status.code, &status.reason, &status.message),
			_ => Self::Other,
		}
	}
}

/// Map a failed API call to the error describing it.
fn api_error(verb: &'static str, id: &ResourceId, error: kube::Error) -> ApplyError {
	let failure = Failure::of_error(&error);
	let message = match &error {
		kube::Error::Api(status) => status.message.clone(),
		_ => String::new(),
	};
	let id = id.clone();
	let source = Box::new(error);

	match failure {
		Failure::Admission => ApplyError::AdmissionRejected {
			id,
			message,
			source,
		},
		Failure::AlreadyExists => ApplyError::AlreadyExists { id, source },
		_ => ApplyError::Request { verb, id, source },
	}
}

/// Executes writes for single resources.
///
/// Cheap to clone; the kube client is shared.
#[derive(Clone, Builder)]
pub struct Applier {
	client: Client,
	#[builder(into, default = DEFAULT_FIELD_MANAGER.to_string())]
	field_manager: String,
	#[builder(default)]
	strategy: ApplyStrategy,
	/// Attempts for conflicting or transiently failing writes.
	#[builder(default)]
	retry: RetryConfig,
	#[builder(default = DEFAULT_POLL_INTERVAL)]
	poll_interval: Duration,
	#[builder(default)]
	cancel: CancellationToken,
}

impl Applier {
	pub fn strategy(&self) -> ApplyStrategy {
		self.strategy
	}

	pub fn poll_interval(&self) -> Duration {
		self.poll_interval
	}

	/// Token that stops retry and poll loops.
	pub fn cancellation(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Create a dynamic API for the given resource.
	fn dynamic_api(&self, resource: &DiscoveredResource, namespace: Option<&str>) -> Api<DynamicObject> {
		match namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource.api_resource),
			None => Api::all_with(self.client.clone(), &resource.api_resource),
		}
	}

	fn decode(id: &ResourceId, object: &DynamicObject) -> Result<Manifest, ApplyError> {
		let value = serde_json::to_value(object).map_err(ApplyError::ManifestConversion)?;
		Manifest::from_value(value).map_err(|source| ApplyError::Decode {
			id: id.clone(),
			source,
		})
	}

	fn to_object(manifest: &Manifest) -> Result<DynamicObject, ApplyError> {
		serde_json::from_value(manifest.as_value().clone()).map_err(ApplyError::ManifestConversion)
	}

	/// Read the live object, `None` when it does not exist.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn get(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
	) -> Result<Option<Manifest>, ApplyError> {
		let api = self.dynamic_api(resource, id.namespace());
		let object = api
			.get_opt(id.name())
			.await
			.map_err(|e| api_error("reading", id, e))?;
		object.map(|object| Self::decode(id, &object)).transpose()
	}

	async fn retrying<T, F, Fut>(
		&self,
		id: &ResourceId,
		operation_name: &str,
		retry_conflicts: bool,
		operation: F,
	) -> Result<T, ApplyError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, ApplyError>>,
	{
		let retryable = |e: &ApplyError| e.is_transient() || (retry_conflicts && e.is_conflict());
		match retry_with_backoff(&self.retry, operation_name, &self.cancel, retryable, operation).await {
			Ok(value) => Ok(value),
			Err(RetryError::Aborted(e)) => Err(e),
			Err(RetryError::Cancelled) => Err(ApplyError::Cancelled { id: id.clone() }),
			Err(RetryError::Exhausted { attempts, source }) if source.is_conflict() => {
				let ApplyError::Request { source, .. } = source else {
					return Err(source);
				};
				Err(ApplyError::ConflictExhausted {
					id: id.clone(),
					attempts,
					source,
				})
			}
			Err(RetryError::Exhausted { source, .. }) => Err(source),
		}
	}

	/// Create the object, stamping the last-applied annotation.
	#[instrument(skip_all, fields(id = %desired.id()))]
	pub async fn create(
		&self,
		resource: &DiscoveredResource,
		desired: &Manifest,
	) -> Result<Manifest, ApplyError> {
		let id = desired.id();
		let object = Self::to_object(&desired.with_last_applied())?;
		let api = self.dynamic_api(resource, id.namespace());
		let params = PostParams {
			field_manager: Some(self.field_manager.clone()),
			..Default::default()
		};

		let (api, params, object) = (&api, &params, &object);
		let created = self
			.retrying(id, "create", false, || async move {
				api.create(params, object)
					.await
					.map_err(|e| api_error("creating", id, e))
			})
			.await?;

		tracing::debug!("created");
		Self::decode(id, &created)
	}

	/// Update the object in place.
	///
	/// `last_applied` is the previously applied manifest; when unknown, the
	/// live object's last-applied annotation is used instead.
	#[instrument(skip_all, fields(id = %desired.id(), strategy = ?self.strategy))]
	pub async fn update(
		&self,
		resource: &DiscoveredResource,
		desired: &Manifest,
		last_applied: Option<&Manifest>,
	) -> Result<Manifest, ApplyError> {
		let id = desired.id();
		let updated = match self.strategy {
			ApplyStrategy::Merge => {
				self.retrying(id, "merge patch", true, || {
					self.merge_patch_once(resource, desired, last_applied)
				})
				.await?
			}
			ApplyStrategy::Server => {
				self.retrying(id, "server-side apply", true, || {
					self.server_side_apply_once(resource, desired)
				})
				.await?
			}
		};

		tracing::debug!(resource_version = ?updated.resource_version(), "updated");
		Ok(updated)
	}

	async fn merge_patch_once(
		&self,
		resource: &DiscoveredResource,
		desired: &Manifest,
		last_applied: Option<&Manifest>,
	) -> Result<Manifest, ApplyError> {
		let id = desired.id();
		// Re-read on every attempt so the precondition tracks the latest write
		let live = self
			.get(resource, id)
			.await?
			.ok_or_else(|| ApplyError::NotFound { id: id.clone() })?;

		let last_applied = last_applied
			.cloned()
			.or_else(|| live.last_applied())
			.map(|m| m.stripped());
		let desired = desired.with_last_applied();

		let mut patch = merge_patch(
			last_applied.as_ref().map(Manifest::as_value),
			desired.as_value(),
			live.as_value(),
		);
		if let (Some(patch), Some(rv)) = (patch.as_object_mut(), live.resource_version()) {
			let metadata = patch
				.entry("metadata")
				.or_insert_with(|| Value::Object(serde_json::Map::new()));
			if let Value::Object(metadata) = metadata {
				metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
			}
		}
		tracing::trace!(%patch, "sending merge patch");

		let api = self.dynamic_api(resource, id.namespace());
		let params = PatchParams {
			field_manager: Some(self.field_manager.clone()),
			..Default::default()
		};
		let patched = api
			.patch(id.name(), &params, &Patch::Merge(&patch))
			.await
			.map_err(|e| api_error("patching", id, e))?;
		Self::decode(id, &patched)
	}

	async fn server_side_apply_once(
		&self,
		resource: &DiscoveredResource,
		desired: &Manifest,
	) -> Result<Manifest, ApplyError> {
		let id = desired.id();
		let desired = desired.with_last_applied();
		let api = self.dynamic_api(resource, id.namespace());
		let params = PatchParams::apply(&self.field_manager).force();

		let applied = api
			.patch(id.name(), &params, &Patch::Apply(desired.as_value()))
			.await
			.map_err(|e| api_error("applying", id, e))?;
		Self::decode(id, &applied)
	}

	/// Request deletion. Returns `false` when the object was already gone.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn delete(&self, resource: &DiscoveredResource, id: &ResourceId) -> Result<bool, ApplyError> {
		let api = self.dynamic_api(resource, id.namespace());
		let params = DeleteParams::background();

		let (api, params) = (&api, &params);
		let result = self
			.retrying(id, "delete", false, || async move {
				match api.delete(id.name(), params).await {
					Ok(_) => Ok(true),
					Err(e) if Failure::of_error(&e) == Failure::NotFound => Ok(false),
					Err(e) => Err(api_error("deleting", id, e)),
				}
			})
			.await?;

		if result {
			tracing::debug!("deletion requested");
		} else {
			tracing::debug!("already absent");
		}
		Ok(result)
	}

	/// Poll until reading the object returns 404.
	#[instrument(skip_all, fields(id = %id))]
	pub async fn wait_deleted(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
		timeout: Duration,
	) -> Result<(), ApplyError> {
		let mut ticker = Ticker::new(self.poll_interval, timeout, self.cancel.clone());
		loop {
			match ticker.tick().await {
				Tick::Poll => {}
				Tick::Expired => return Err(ApplyError::DeleteTimeout { id: id.clone() }),
				Tick::Cancelled => return Err(ApplyError::Cancelled { id: id.clone() }),
			}
			match self.get(resource, id).await {
				Ok(None) => return Ok(()),
				Ok(Some(_)) => tracing::trace!("still present"),
				Err(e) if e.is_transient() => tracing::warn!(error = %e, "read failed while waiting for deletion"),
				Err(e) => return Err(e),
			}
		}
	}

	/// Delete and block until the object is gone.
	pub async fn delete_and_wait(
		&self,
		resource: &DiscoveredResource,
		id: &ResourceId,
		timeout: Duration,
	) -> Result<(), ApplyError> {
		if self.delete(resource, id).await? {
			self.wait_deleted(resource, id, timeout).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case::invalid(422, "Invalid", "spec.replicas: Invalid value", Failure::Admission)]
	#[case::bad_request(400, "BadRequest", "strict decoding error", Failure::Admission)]
	#[case::webhook(403, "Forbidden", "admission webhook \"deny.example.com\" denied the request", Failure::Admission)]
	#[case::rbac(403, "Forbidden", "cannot patch resource", Failure::Other)]
	#[case::not_found(404, "NotFound", "not found", Failure::NotFound)]
	#[case::already_exists(409, "AlreadyExists", "already exists", Failure::AlreadyExists)]
	#[case::conflict(409, "Conflict", "the object has been modified", Failure::Conflict)]
	#[case::throttled(429, "TooManyRequests", "slow down", Failure::Transient)]
	#[case::unavailable(503, "ServiceUnavailable", "try again", Failure::Transient)]
	fn test_failure_classes(
		#[case] code: u16,
		#[case] reason: &str,
		#[case] message: &str,
		#[case] expected: Failure,
	) {
		assert_eq!(Failure::of(code, reason, message), expected);
	}

	#[test]
	fn test_admission_message_follows_id() {
		let message = "Deployment.apps \"example\" is invalid: spec.selector: Invalid value: {}: field is immutable";
		let error = ApplyError::AdmissionRejected {
			id: ResourceId::decode("apps/Deployment/test/example").unwrap(),
			message: message.to_string(),
			source: Box::new(kube::Error::Service(std::io::Error::other("rejected").into())),
		};
		assert_eq!(error.to_string(), format!("apps/Deployment/test/example: {message}"));
		assert!(error.is_immutable_rejection());
	}

	#[test]
	fn test_strategy_serde() {
		let strategy: ApplyStrategy = serde_json::from_str("\"server\"").unwrap();
		assert_eq!(strategy, ApplyStrategy::Server);
		assert_eq!(ApplyStrategy::default(), ApplyStrategy::Merge);
	}
}
